use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::events::ProjectLog;

/// Exit code reported when the executable cannot be found.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;
/// Exit code reported for any other spawn or I/O failure.
pub const EXIT_SPAWN_FAILED: i32 = 1;

/// A command to run to completion.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    /// Added on top of the inherited host environment.
    pub env: BTreeMap<String, String>,
    /// Discard the command's output instead of logging it.
    pub quiet: bool,
}

impl CommandRequest {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            quiet: false,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Arguments as lossy UTF-8, for matching and display.
    pub fn arg_strs(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.arg_strs());
        parts.join(" ")
    }
}

/// Runs external commands, streaming output lines to a project log.
///
/// Implementations never fail: spawn errors become an exit code plus one
/// diagnostic line. Everything above this layer relies on that.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, req: &CommandRequest, log: &ProjectLog) -> i32;
}

/// Runs commands as real child processes via `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCommandRunner;

impl ProcessCommandRunner {
    async fn spawn_and_stream(&self, req: &CommandRequest, log: &ProjectLog) -> io::Result<i32> {
        let mut cmd = Command::new(&req.program);
        cmd.args(&req.args);
        cmd.current_dir(&req.cwd);
        cmd.envs(&req.env);
        cmd.stdin(Stdio::null());

        if req.quiet {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
            let status = cmd.status().await?;
            return Ok(status.code().unwrap_or(-1));
        }

        // One pipe behind both fds keeps stdout and stderr lines in order
        let (reader, writer) = io::pipe()?;
        cmd.stdout(writer.try_clone()?);
        cmd.stderr(writer);

        let mut child = cmd.spawn()?;
        // The command still owns write ends; the reader only sees EOF once they close
        drop(cmd);

        let forward = log.clone();
        let _ = tokio::task::spawn_blocking(move || forward_lines(reader, &forward)).await;
        let status = child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, req: &CommandRequest, log: &ProjectLog) -> i32 {
        tracing::debug!(
            project = %log.project(),
            command = %req.display(),
            cwd = %req.cwd.display(),
            "running command"
        );
        match self.spawn_and_stream(req, log).await {
            Ok(code) => {
                tracing::debug!(project = %log.project(), code, "command finished");
                code
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log.line(format!(
                    "Command not found: {} ({e})",
                    req.program.display()
                ));
                EXIT_COMMAND_NOT_FOUND
            }
            Err(e) => {
                log.line(format!("Error running command: {e}"));
                EXIT_SPAWN_FAILED
            }
        }
    }
}

/// Forward every line of `reader` to `log` until EOF.
fn forward_lines(reader: impl Read, log: &ProjectLog) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => emit_line(&buf, log),
        }
    }
}

/// Log one raw output line: lossy UTF-8, line ending stripped.
pub(crate) fn emit_line(raw: &[u8], log: &ProjectLog) {
    let line = String::from_utf8_lossy(raw);
    log.line(line.trim_end_matches(['\n', '\r']));
}
