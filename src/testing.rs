//! Test helpers: a scripted command runner and fake venvs on disk.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::command::{CommandRequest, CommandRunner};
use crate::events::{EventKind, LauncherEvent, ProjectLog, drain_pending};
use crate::venv::{PYVENV_CFG, VenvLayout};

type Responder = Box<dyn Fn(&CommandRequest) -> i32 + Send + Sync>;

/// Records every request and answers with a scripted exit code.
pub struct ScriptedRunner {
    calls: Mutex<Vec<CommandRequest>>,
    responder: Responder,
}

impl ScriptedRunner {
    pub fn new(responder: impl Fn(&CommandRequest) -> i32 + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        })
    }

    pub fn calls(&self) -> Vec<CommandRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&CommandRequest) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|r| pred(r)).count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, req: &CommandRequest, log: &ProjectLog) -> i32 {
        self.calls.lock().unwrap().push(req.clone());
        let code = (self.responder)(req);
        log.line(format!("[scripted] {} -> {code}", req.display()));
        code
    }
}

pub fn is_version_check(req: &CommandRequest) -> bool {
    req.arg_strs() == ["-V"]
}

pub fn is_venv_create(req: &CommandRequest) -> bool {
    req.arg_strs().starts_with(&["-m".to_string(), "venv".to_string()])
}

pub fn is_pip_install(req: &CommandRequest) -> bool {
    let args = req.arg_strs();
    args.starts_with(&["-m".to_string(), "pip".to_string()]) && args.iter().any(|a| a == "-r")
}

pub fn is_pip_upgrade(req: &CommandRequest) -> bool {
    req.arg_strs().iter().any(|a| a == "--upgrade")
}

/// Default responder behaviour for venv creation: lay down a fake venv at
/// the requested directory and succeed.
pub fn create_requested_venv(req: &CommandRequest) -> i32 {
    match req.args.get(2) {
        Some(dir) => {
            create_fake_venv(Path::new(dir), None);
            0
        }
        None => 2,
    }
}

/// Write a venv skeleton whose interpreter is an `sh` script that sleeps.
pub fn create_fake_venv(venv_dir: &Path, home: Option<&Path>) -> PathBuf {
    create_fake_venv_with(venv_dir, home, "exec sleep 30")
}

pub fn create_fake_venv_with(venv_dir: &Path, home: Option<&Path>, body: &str) -> PathBuf {
    let python = VenvLayout::default().interpreter_in(venv_dir);
    write_script(&python, body);
    if let Some(home) = home {
        std::fs::write(
            venv_dir.join(PYVENV_CFG),
            format!("home = {}\nversion = 3.12.0\n", home.display()),
        )
        .unwrap();
    }
    python
}

pub fn write_script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

pub fn log_lines(rx: &mut UnboundedReceiver<LauncherEvent>) -> Vec<String> {
    drain_pending(rx)
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::Log { line } => Some(line),
            _ => None,
        })
        .collect()
}
