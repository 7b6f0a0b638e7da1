use std::ffi::OsString;
use std::sync::Arc;

use crate::command::{CommandRequest, CommandRunner};
use crate::error::LauncherError;
use crate::events::ProjectLog;
use crate::project::Project;
use crate::venv::EnvironmentManager;

/// Silences pip's "new version available" notice.
pub const PIP_VERSION_CHECK_ENV: &str = "PIP_DISABLE_PIP_VERSION_CHECK";

/// Upgraded between the first and second install attempt.
pub const BUILD_TOOLING: [&str; 3] = ["pip", "setuptools", "wheel"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// No manifest declared, or it is missing on disk.
    NoManifest,
    /// Marker present and the project doesn't reinstall on every run.
    Skipped,
    /// Installed after `attempts` tries (1 or 2).
    Installed { attempts: u8 },
}

/// Installs a project's requirements into its venv.
///
/// Policy: one install; on failure upgrade pip/setuptools/wheel and, if
/// that worked, install exactly once more. Nothing else retries.
pub struct DependencyInstaller {
    envs: Arc<EnvironmentManager>,
    runner: Arc<dyn CommandRunner>,
}

impl DependencyInstaller {
    pub fn new(envs: Arc<EnvironmentManager>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { envs, runner }
    }

    pub async fn install(
        &self,
        project: &Project,
        log: &ProjectLog,
    ) -> Result<InstallOutcome, LauncherError> {
        let Some(manifest) = project.requirements_path().filter(|p| p.exists()) else {
            return Ok(InstallOutcome::NoManifest);
        };

        let marker = project.marker_path();
        if marker.exists() && !project.install_on_run() {
            log.line("Skipping requirements (already installed).");
            return Ok(InstallOutcome::Skipped);
        }

        let usable = match project.venv_python() {
            Some(python) => self.envs.probe().is_valid(&python, log).await,
            None => false,
        };
        if !usable {
            self.envs.ensure(project, false, log).await?;
        }

        let manifest_name = manifest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        log.line(format!("Installing requirements from {manifest_name} ..."));

        let install_args = || -> Vec<OsString> {
            vec!["install".into(), "-r".into(), manifest.clone().into_os_string()]
        };

        let code = self.pip(project, install_args(), log).await;
        if code == 0 {
            self.write_marker(project, log);
            log.line("Requirements installed.");
            return Ok(InstallOutcome::Installed { attempts: 1 });
        }

        log.line(format!(
            "pip install failed (exit {code}). Retrying after upgrading pip/setuptools/wheel..."
        ));
        let mut upgrade: Vec<OsString> = vec!["install".into(), "--upgrade".into()];
        upgrade.extend(BUILD_TOOLING.iter().map(OsString::from));
        let up_code = self.pip(project, upgrade, log).await;
        if up_code != 0 {
            tracing::warn!(project = %project.name(), code = up_code, "pip upgrade failed");
            log.line(format!("Upgrade step failed (exit {up_code}). Giving up."));
            return Err(LauncherError::Upgrade(up_code));
        }

        let retry_code = self.pip(project, install_args(), log).await;
        if retry_code == 0 {
            self.write_marker(project, log);
            log.line("Requirements installed on retry.");
            return Ok(InstallOutcome::Installed { attempts: 2 });
        }

        tracing::warn!(project = %project.name(), code = retry_code, "requirements install failed twice");
        log.line(format!(
            "Second attempt failed (exit {retry_code}). See log above for details."
        ));
        Err(LauncherError::Install(retry_code))
    }

    async fn pip(&self, project: &Project, args: Vec<OsString>, log: &ProjectLog) -> i32 {
        let Some(python) = project.venv_python().filter(|p| p.exists()) else {
            log.line("Internal error: venv python missing");
            return 1;
        };

        let mut req = CommandRequest::new(python, project.path())
            .args(["-m", "pip"])
            .args(args);
        if std::env::var_os(PIP_VERSION_CHECK_ENV).is_none() {
            req = req.env(PIP_VERSION_CHECK_ENV, "1");
        }
        log.line(format!("$ {}", req.display()));
        self.runner.run(&req, log).await
    }

    fn write_marker(&self, project: &Project, log: &ProjectLog) {
        if let Err(e) = std::fs::write(project.marker_path(), "ok") {
            tracing::warn!(project = %project.name(), error = %e, "failed to write install marker");
            log.line(format!("Could not write install marker: {e}"));
        }
    }
}
