use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::project::ProjectStatus;

#[derive(Debug, Clone, Serialize)]
pub struct LauncherEvent {
    pub project: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Log { line: String },
    Status { status: ProjectStatus },
}

/// Producer side of the launcher event queue.
///
/// Cheap to clone; every task that acts on a project holds its own copy.
/// A single consumer owns the receiver returned by [`EventSink::channel`].
/// Sends after the receiver is gone are dropped silently.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<LauncherEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LauncherEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn for_project(&self, name: &str) -> ProjectLog {
        ProjectLog {
            project: Arc::from(name),
            sink: self.clone(),
        }
    }

    fn emit(&self, project: &str, kind: EventKind) {
        let _ = self.tx.send(LauncherEvent {
            project: project.to_string(),
            timestamp: Utc::now(),
            kind,
        });
    }
}

/// Log handle scoped to one project.
#[derive(Debug, Clone)]
pub struct ProjectLog {
    project: Arc<str>,
    sink: EventSink,
}

impl ProjectLog {
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn line(&self, text: impl Into<String>) {
        let line = text.into();
        tracing::trace!(project = %self.project, %line, "log");
        self.sink.emit(&self.project, EventKind::Log { line });
    }

    pub(crate) fn status(&self, status: &ProjectStatus) {
        self.sink.emit(
            &self.project,
            EventKind::Status {
                status: status.clone(),
            },
        );
    }
}

/// Take every event queued so far without waiting.
pub fn drain_pending(rx: &mut mpsc::UnboundedReceiver<LauncherEvent>) -> Vec<LauncherEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
