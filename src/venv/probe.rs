use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::command::{CommandRequest, CommandRunner};
use crate::events::ProjectLog;

use super::{PYVENV_CFG, VenvLayout};

/// Locates venvs and decides whether an interpreter is usable.
pub struct EnvironmentProbe {
    layout: VenvLayout,
    runner: Arc<dyn CommandRunner>,
}

impl EnvironmentProbe {
    pub fn new(layout: VenvLayout, runner: Arc<dyn CommandRunner>) -> Self {
        Self { layout, runner }
    }

    pub fn layout(&self) -> &VenvLayout {
        &self.layout
    }

    pub fn find_root(&self, project_dir: &Path) -> Option<PathBuf> {
        self.layout.find_root(project_dir)
    }

    pub fn find_shallow(&self, project_dir: &Path) -> Option<PathBuf> {
        self.layout.find_shallow(project_dir)
    }

    /// Two-tier check. Static first: the interpreter must exist and the
    /// declared `home` (if any) must still exist; a dangling home is
    /// broken no matter what. Then live: `python -V` must exit 0.
    pub async fn is_valid(&self, python: &Path, log: &ProjectLog) -> bool {
        if !python.exists() {
            return false;
        }

        let venv_dir = self.layout.venv_root_of(python);
        if let Some(home) = venv_dir.as_deref().and_then(read_declared_home) {
            if !Path::new(&home).exists() {
                tracing::debug!(
                    project = %log.project(),
                    python = %python.display(),
                    %home,
                    "venv home is gone"
                );
                return false;
            }
        }

        let cwd = venv_dir
            .or_else(|| python.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        let req = CommandRequest::new(python, cwd).arg("-V").quiet();
        self.runner.run(&req, log).await == 0
    }
}

/// Read the `home` entry from a venv's `pyvenv.cfg`, if both exist.
pub fn read_declared_home(venv_dir: &Path) -> Option<String> {
    let content = std::fs::read(venv_dir.join(PYVENV_CFG)).ok()?;
    let content = String::from_utf8_lossy(&content);
    content.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("home") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}
