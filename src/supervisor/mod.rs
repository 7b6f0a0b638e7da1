use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::command::{CommandRunner, emit_line};
use crate::error::LauncherError;
use crate::events::ProjectLog;
use crate::install::DependencyInstaller;
use crate::project::{Project, ProjectStatus};
use crate::venv::{EnsureOutcome, EnvironmentManager};

#[cfg(test)]
mod tests;

#[cfg(windows)]
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;

/// How often the output tail checks the log file for new lines.
const TAIL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Interpreter used when the project has no usable venv interpreter.
    pub fallback_python: PathBuf,
    /// How long a stop waits after the graceful signal before killing.
    pub stop_timeout: Duration,
    /// Redirect the launched script's stdout/stderr to the project's output
    /// file and tail it into the project log.
    pub capture_output: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            fallback_python: PathBuf::from(crate::config::DEFAULT_PYTHON),
            stop_timeout: Duration::from_secs(5),
            capture_output: cfg!(unix),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running.
    Idle,
    Stopped,
    Killed,
    /// The kill itself failed; the handle is kept.
    Failed,
}

/// Runs a project end to end: venv, requirements, detached launch. Also
/// stops it and rebuilds its venv.
///
/// `start`, `stop` and `rebuild` hold the project's operation guard for
/// their whole duration, so two of them never interleave on one project.
pub struct ProjectRunner {
    envs: Arc<EnvironmentManager>,
    installer: DependencyInstaller,
    options: RunnerOptions,
}

impl ProjectRunner {
    pub fn new(
        envs: Arc<EnvironmentManager>,
        runner: Arc<dyn CommandRunner>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            installer: DependencyInstaller::new(envs.clone(), runner),
            envs,
            options,
        }
    }

    pub fn environments(&self) -> &EnvironmentManager {
        &self.envs
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Prepare and launch the project. Returns the child's pid.
    pub async fn start(&self, project: &Project, log: &ProjectLog) -> Result<u32, LauncherError> {
        let _guard = project.lock_ops().await;
        project.set_status(ProjectStatus::Preparing, log);

        let Some(entrypoint) = project.entrypoint() else {
            log.line("No entrypoint detected. Set one before running.");
            project.set_status(ProjectStatus::NeedEntrypoint, log);
            return Err(LauncherError::NeedEntrypoint);
        };

        if let Err(e) = self.envs.ensure(project, false, log).await {
            project.set_status(ProjectStatus::VenvError, log);
            return Err(e);
        }

        let python = project
            .venv_python()
            .filter(|p| p.exists())
            .unwrap_or_else(|| self.options.fallback_python.clone());

        let entry = project.path().join(&entrypoint);
        if !entry.exists() {
            log.line(format!("Entrypoint '{entrypoint}' not found."));
            project.set_status(ProjectStatus::MissingEntrypoint, log);
            return Err(LauncherError::MissingEntrypoint(entrypoint));
        }

        if let Err(e) = self.installer.install(project, log).await {
            project.set_status(ProjectStatus::InstallFailed, log);
            return Err(e);
        }

        match self.launch(project, &python, &entry, log) {
            Ok(pid) => {
                tracing::info!(project = %project.name(), pid, python = %python.display(), "launched");
                project.set_status(ProjectStatus::Running { pid }, log);
                log.line(format!(
                    "Launched with {} {entrypoint}",
                    python
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default()
                ));
                Ok(pid)
            }
            Err(e) => {
                tracing::warn!(project = %project.name(), error = %e, "launch failed");
                project.set_status(ProjectStatus::LaunchFailed, log);
                log.line(format!("Launch failed: {e}"));
                Err(LauncherError::Launch(e.to_string()))
            }
        }
    }

    fn launch(
        &self,
        project: &Project,
        python: &Path,
        entry: &Path,
        log: &ProjectLog,
    ) -> std::io::Result<u32> {
        let mut cmd = Command::new(python);
        cmd.arg(entry);
        cmd.args(project.split_args());
        cmd.current_dir(project.path());
        cmd.stdin(Stdio::null());
        // Never a pipe: the child keeps writing after the launcher exits
        let output = if self.options.capture_output {
            let path = project.output_log_path();
            let file = std::fs::File::create(&path)?;
            cmd.stdout(file.try_clone()?);
            cmd.stderr(file);
            Some(path)
        } else {
            None
        };
        detach(&mut cmd);

        let child = cmd.spawn()?;
        let pid = child.id().unwrap_or_default();
        drop(cmd);

        if let Some(path) = output {
            let (tx, rx) = watch::channel(());
            spawn_output_tail(path, log.clone(), rx);
            project.set_output_tail(tx);
        }

        if let Some(previous) = project.replace_child(child) {
            tracing::warn!(
                project = %project.name(),
                previous_pid = ?previous.id(),
                "replacing handle of a previous launch"
            );
        }
        Ok(pid)
    }

    /// Stop the running child: graceful signal, wait, then kill.
    pub async fn stop(&self, project: &Project, log: &ProjectLog) -> StopOutcome {
        let _guard = project.lock_ops().await;

        let Some(mut child) = project.take_live_child() else {
            project.set_status(ProjectStatus::Idle, log);
            return StopOutcome::Idle;
        };

        if let Some(pid) = child.id() {
            request_terminate(pid, log).await;
        }

        match tokio::time::timeout(self.options.stop_timeout, child.wait()).await {
            Ok(Ok(_)) => {
                tracing::info!(project = %project.name(), "stopped");
                project.end_output_tail();
                project.set_status(ProjectStatus::Stopped, log);
                log.line("Stopped.");
                return StopOutcome::Stopped;
            }
            Ok(Err(e)) => {
                tracing::warn!(project = %project.name(), error = %e, "wait failed, killing");
            }
            Err(_) => {
                tracing::info!(project = %project.name(), "graceful stop timed out, killing");
            }
        }

        force_kill(project, child, log).await
    }

    /// Back up and recreate the project's venv regardless of its health.
    pub async fn rebuild(
        &self,
        project: &Project,
        log: &ProjectLog,
    ) -> Result<EnsureOutcome, LauncherError> {
        let _guard = project.lock_ops().await;
        project.set_status(ProjectStatus::Rebuilding, log);

        match self.envs.ensure(project, true, log).await {
            Ok(outcome) => {
                project.set_status(ProjectStatus::VenvRebuilt, log);
                log.line("Venv rebuilt successfully.");
                Ok(outcome)
            }
            Err(e) => {
                project.set_status(ProjectStatus::VenvRebuildFailed, log);
                log.line("Failed to rebuild venv.");
                Err(e)
            }
        }
    }
}

/// Level-triggered status sync: a child that has exited while the status
/// still says running becomes `Exited`. Returns whether it changed.
pub fn reconcile(project: &Project, log: &ProjectLog) -> bool {
    if project.status().is_running() && project.has_exited() {
        project.end_output_tail();
        project.set_status(ProjectStatus::Exited, log);
        log.line("Process exited.");
        return true;
    }
    false
}

async fn force_kill(project: &Project, mut child: Child, log: &ProjectLog) -> StopOutcome {
    match child.kill().await {
        Ok(()) => {
            project.end_output_tail();
            project.set_status(ProjectStatus::Killed, log);
            log.line("Killed.");
            StopOutcome::Killed
        }
        Err(e) => {
            tracing::warn!(project = %project.name(), error = %e, "kill failed");
            log.line(format!("Failed to stop: {e}"));
            project.replace_child(child);
            StopOutcome::Failed
        }
    }
}

/// Follow the launch's output file into the log. Once `stop` closes, the
/// rest of the file is read and the task ends.
fn spawn_output_tail(path: PathBuf, log: ProjectLog, mut stop: watch::Receiver<()>) {
    tokio::spawn(async move {
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot open output log");
                return;
            }
        };
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut stopping = false;
        loop {
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    if stopping {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(TAIL_POLL) => {}
                        _ = stop.changed() => stopping = true,
                    }
                }
                Ok(_) => {
                    // A partial line waits for the rest of it
                    if buf.ends_with(b"\n") {
                        emit_line(&buf, &log);
                        buf.clear();
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "output log read failed");
                    break;
                }
            }
        }
        if !buf.is_empty() {
            emit_line(&buf, &log);
        }
    });
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    // Own process group: signals aimed at the launcher don't reach the child
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    cmd.creation_flags(CREATE_NEW_CONSOLE);
}

#[cfg(not(any(unix, windows)))]
fn detach(_cmd: &mut Command) {}

#[cfg(unix)]
async fn request_terminate(pid: u32, log: &ProjectLog) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    // The child leads its own group, so this reaches its children too
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGTERM) {
        if e != Errno::ESRCH {
            tracing::warn!(pid, error = %e, "SIGTERM failed");
            log.line(format!("Terminate request failed: {e}"));
        }
    }
}

#[cfg(windows)]
async fn request_terminate(pid: u32, log: &ProjectLog) {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        tracing::warn!(pid, error = %e, "taskkill failed");
        log.line(format!("Terminate request failed: {e}"));
    }
}

#[cfg(not(any(unix, windows)))]
async fn request_terminate(_pid: u32, _log: &ProjectLog) {}
