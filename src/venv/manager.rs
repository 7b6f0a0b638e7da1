use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::command::{CommandRequest, CommandRunner};
use crate::error::LauncherError;
use crate::events::ProjectLog;
use crate::project::Project;

use super::EnvironmentProbe;
use super::probe::read_declared_home;

/// Appended to a broken venv's directory name when it is moved aside.
pub const BACKUP_SUFFIX: &str = ".broken_backup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A healthy root venv was already there.
    Existing(PathBuf),
    /// A fresh root venv was created.
    Created(PathBuf),
}

impl EnsureOutcome {
    pub fn python(&self) -> &Path {
        match self {
            EnsureOutcome::Existing(p) | EnsureOutcome::Created(p) => p,
        }
    }
}

/// Validates, repairs and (re)creates a project's root venv.
///
/// Callers hold the project's operation guard; nothing here locks it.
pub struct EnvironmentManager {
    probe: Arc<EnvironmentProbe>,
    runner: Arc<dyn CommandRunner>,
    base_python: PathBuf,
}

impl EnvironmentManager {
    pub fn new(
        probe: Arc<EnvironmentProbe>,
        runner: Arc<dyn CommandRunner>,
        base_python: impl Into<PathBuf>,
    ) -> Self {
        Self {
            probe,
            runner,
            base_python: base_python.into(),
        }
    }

    pub fn probe(&self) -> &EnvironmentProbe {
        &self.probe
    }

    pub fn base_python(&self) -> &Path {
        &self.base_python
    }

    pub async fn ensure(
        &self,
        project: &Project,
        force_rebuild: bool,
        log: &ProjectLog,
    ) -> Result<EnsureOutcome, LauncherError> {
        let layout = self.probe.layout();
        let target_dir = layout.target_dir(project.path());

        if force_rebuild {
            // Every root alias is moved aside; nothing existing is reused
            let existing = layout.root_dirs(project.path());
            if !existing.is_empty() {
                log.line("Force rebuilding venv...");
            }
            for dir in &existing {
                self.move_aside(project, dir, log);
            }
            project.set_venv_python(None);
        } else if let Some(python) = self.adopt_or_discard(project, log).await {
            return Ok(EnsureOutcome::Existing(python));
        }

        log.line(format!(
            "Creating fresh {} in project root...",
            target_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        let req = CommandRequest::new(&self.base_python, project.path())
            .args(["-m", "venv"])
            .arg(target_dir.as_os_str());
        let code = self.runner.run(&req, log).await;
        if code != 0 {
            tracing::warn!(project = %project.name(), code, "venv creation failed");
            log.line(format!("Failed to create venv (exit {code})."));
            return Err(LauncherError::VenvCreate(code));
        }

        let python = layout.interpreter_in(&target_dir);
        project.set_venv_python(Some(python.clone()));
        project.mark_fresh_venv();
        tracing::info!(project = %project.name(), venv = %python.display(), "venv created");
        log.line(format!("Venv created: {}", python.display()));
        Ok(EnsureOutcome::Created(python))
    }

    /// Adopt a healthy root venv, or move broken ones out of the way.
    async fn adopt_or_discard(&self, project: &Project, log: &ProjectLog) -> Option<PathBuf> {
        let layout = self.probe.layout();

        if let Some(python) = self.probe.find_root(project.path()) {
            if self.probe.is_valid(&python, log).await {
                tracing::info!(project = %project.name(), venv = %python.display(), "using existing venv");
                log.line(format!("Using existing venv: {}", python.display()));
                project.set_venv_python(Some(python.clone()));
                return Some(python);
            }
            if let Some(dir) = layout.venv_root_of(&python) {
                log.line(format!(
                    "Root venv appears broken: {} (home='{}').",
                    python.display(),
                    read_declared_home(&dir).unwrap_or_default()
                ));
                self.move_aside(project, &dir, log);
            }
        }

        if let Some(previous) = project.venv_python() {
            if !self.probe.is_valid(&previous, log).await {
                let dir = layout.venv_root_of(&previous);
                log.line(format!(
                    "Detected existing venv appears broken: {} (home='{}').",
                    previous.display(),
                    dir.as_deref().and_then(read_declared_home).unwrap_or_default()
                ));
                if let Some(dir) = dir.filter(|d| d.exists()) {
                    backup_dir(&dir, log);
                }
                project.set_venv_python(None);
            }
        }
        None
    }

    /// Back up `dir` and forget the project's interpreter if it lived there.
    fn move_aside(&self, project: &Project, dir: &Path, log: &ProjectLog) {
        if backup_dir(dir, log).is_some()
            && project.venv_python().is_some_and(|p| p.starts_with(dir))
        {
            project.set_venv_python(None);
        }
    }
}

/// First free sibling name: `<name>.broken_backup`, then `_2`, `_3`, ...
pub fn backup_destination(dir: &Path) -> Option<PathBuf> {
    let name = dir.file_name()?.to_string_lossy();
    let parent = dir.parent()?;
    let base = format!("{name}{BACKUP_SUFFIX}");

    let mut dest = parent.join(&base);
    let mut idx = 1;
    while dest.exists() {
        idx += 1;
        dest = parent.join(format!("{base}_{idx}"));
    }
    Some(dest)
}

/// Move `dir` aside. Failures are logged and swallowed.
pub fn backup_dir(dir: &Path, log: &ProjectLog) -> Option<PathBuf> {
    let Some(dest) = backup_destination(dir) else {
        log.line(format!("Failed to backup broken venv ({}): no parent", dir.display()));
        return None;
    };
    match std::fs::rename(dir, &dest) {
        Ok(()) => {
            tracing::info!(from = %dir.display(), to = %dest.display(), "backed up venv");
            log.line(format!("Backed up broken venv to: {}", dest.display()));
            Some(dest)
        }
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "venv backup failed");
            log.line(format!("Failed to backup broken venv ({}): {e}", dir.display()));
            None
        }
    }
}
