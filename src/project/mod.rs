pub mod discovery;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::watch;

use crate::events::ProjectLog;
use crate::venv::VenvLayout;

pub use discovery::{ENTRY_CANDIDATES, REQUIREMENTS_CANDIDATES, detect_entrypoint, detect_requirements, scan};

/// Presence of this file in a project means requirements were installed once.
pub const INSTALL_MARKER: &str = ".launcher_installed.flag";

/// Captured stdout/stderr of the last launch, truncated on every launch.
pub const OUTPUT_LOG: &str = ".launcher_output.log";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Idle,
    Preparing,
    Running {
        pid: u32,
    },
    Exited,
    Stopped,
    Killed,
    NeedEntrypoint,
    MissingEntrypoint,
    VenvError,
    InstallFailed,
    LaunchFailed,
    Rebuilding,
    VenvRebuilt,
    VenvRebuildFailed,
}

impl ProjectStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProjectStatus::Running { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ProjectStatus::NeedEntrypoint
                | ProjectStatus::MissingEntrypoint
                | ProjectStatus::VenvError
                | ProjectStatus::InstallFailed
                | ProjectStatus::LaunchFailed
                | ProjectStatus::VenvRebuildFailed
        )
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectStatus::Idle => f.write_str("Idle"),
            ProjectStatus::Preparing => f.write_str("Preparing"),
            ProjectStatus::Running { pid } => write!(f, "Running (pid={pid})"),
            ProjectStatus::Exited => f.write_str("Exited"),
            ProjectStatus::Stopped => f.write_str("Stopped"),
            ProjectStatus::Killed => f.write_str("Killed"),
            ProjectStatus::NeedEntrypoint => f.write_str("Need-entrypoint"),
            ProjectStatus::MissingEntrypoint => f.write_str("Missing-entrypoint"),
            ProjectStatus::VenvError => f.write_str("Venv-error"),
            ProjectStatus::InstallFailed => f.write_str("Install-failed"),
            ProjectStatus::LaunchFailed => f.write_str("Launch-failed"),
            ProjectStatus::Rebuilding => f.write_str("Rebuilding"),
            ProjectStatus::VenvRebuilt => f.write_str("Venv-rebuilt"),
            ProjectStatus::VenvRebuildFailed => f.write_str("Venv-rebuild-failed"),
        }
    }
}

#[derive(Debug, Default)]
struct ProjectState {
    entrypoint: Option<String>,
    args: String,
    install_on_run: bool,
    venv_python: Option<PathBuf>,
    fresh_venv: bool,
    status: ProjectStatus,
    child: Option<Child>,
    /// Dropping this ends the task that tails the output log.
    output_tail: Option<watch::Sender<()>>,
}

/// One project directory discovered under the launcher root.
///
/// Identity (path, name, requirements file) is fixed at discovery. The
/// rest is mutable session state behind a short-lived lock that is never
/// held across an await. Long operations serialize on `ops` instead.
#[derive(Debug)]
pub struct Project {
    path: PathBuf,
    name: String,
    requirements: Option<String>,
    state: Mutex<ProjectState>,
    ops: tokio::sync::Mutex<()>,
}

impl Project {
    /// Inspect `path` and build a project with detected entrypoint,
    /// requirements file and venv interpreter.
    pub fn open(path: PathBuf, install_on_run: bool, layout: &VenvLayout) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let state = ProjectState {
            entrypoint: detect_entrypoint(&path),
            install_on_run,
            venv_python: layout.detect(&path),
            ..Default::default()
        };
        Self {
            requirements: detect_requirements(&path),
            path,
            name,
            state: Mutex::new(state),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ProjectState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requirements(&self) -> Option<&str> {
        self.requirements.as_deref()
    }

    pub fn requirements_path(&self) -> Option<PathBuf> {
        self.requirements.as_ref().map(|r| self.path.join(r))
    }

    pub fn marker_path(&self) -> PathBuf {
        self.path.join(INSTALL_MARKER)
    }

    pub fn output_log_path(&self) -> PathBuf {
        self.path.join(OUTPUT_LOG)
    }

    pub fn entrypoint(&self) -> Option<String> {
        self.state().entrypoint.clone()
    }

    pub fn set_entrypoint(&self, entrypoint: Option<String>) {
        self.state().entrypoint = entrypoint.filter(|e| !e.trim().is_empty());
    }

    pub fn args(&self) -> String {
        self.state().args.clone()
    }

    pub fn set_args(&self, args: impl Into<String>) {
        self.state().args = args.into();
    }

    /// Stored argument string split on whitespace.
    pub fn split_args(&self) -> Vec<String> {
        self.state()
            .args
            .split_whitespace()
            .map(String::from)
            .collect()
    }

    pub fn install_on_run(&self) -> bool {
        self.state().install_on_run
    }

    pub fn set_install_on_run(&self, value: bool) {
        self.state().install_on_run = value;
    }

    pub fn venv_python(&self) -> Option<PathBuf> {
        self.state().venv_python.clone()
    }

    pub(crate) fn set_venv_python(&self, python: Option<PathBuf>) {
        self.state().venv_python = python;
    }

    /// Whether the venv was created during this session.
    pub fn fresh_venv(&self) -> bool {
        self.state().fresh_venv
    }

    pub(crate) fn mark_fresh_venv(&self) {
        self.state().fresh_venv = true;
    }

    pub fn status(&self) -> ProjectStatus {
        self.state().status.clone()
    }

    pub(crate) fn set_status(&self, status: ProjectStatus, log: &ProjectLog) {
        tracing::debug!(project = %self.name, %status, "status changed");
        self.state().status = status.clone();
        log.status(&status);
    }

    pub fn pid(&self) -> Option<u32> {
        self.state().child.as_ref().and_then(|c| c.id())
    }

    /// True when a child handle exists and that child has terminated.
    pub fn has_exited(&self) -> bool {
        match self.state().child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// True when a child handle exists and the child is still alive.
    pub fn is_running(&self) -> bool {
        match self.state().child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Store a new child handle, returning the one it replaces.
    pub(crate) fn replace_child(&self, child: Child) -> Option<Child> {
        self.state().child.replace(child)
    }

    /// Take the child handle if it is still alive. A handle whose process
    /// already exited is discarded.
    pub(crate) fn take_live_child(&self) -> Option<Child> {
        let mut state = self.state();
        let alive = match state.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        let child = state.child.take();
        if alive {
            child
        } else {
            state.output_tail = None;
            None
        }
    }

    pub(crate) fn set_output_tail(&self, tail: watch::Sender<()>) {
        self.state().output_tail = Some(tail);
    }

    /// Let the output tail read what is left and finish.
    pub(crate) fn end_output_tail(&self) {
        self.state().output_tail = None;
    }

    pub(crate) async fn lock_ops(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.ops.lock().await
    }
}
