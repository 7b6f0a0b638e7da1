#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use super::*;
use crate::command::CommandRequest;
use crate::events::{EventKind, EventSink, LauncherEvent, drain_pending};
use crate::project::ProjectStatus;
use crate::testing::{
    ScriptedRunner, create_fake_venv, create_fake_venv_with, create_requested_venv, is_pip_install,
    is_pip_upgrade, is_venv_create, is_version_check, log_lines, write_script,
};
use crate::venv::{EnvironmentProbe, VenvLayout};

fn supervisor(script: Arc<ScriptedRunner>, stop_timeout: Duration) -> ProjectRunner {
    supervisor_with_fallback(script, stop_timeout, PathBuf::from("python3"))
}

fn supervisor_with_fallback(
    script: Arc<ScriptedRunner>,
    stop_timeout: Duration,
    fallback_python: PathBuf,
) -> ProjectRunner {
    let probe = Arc::new(EnvironmentProbe::new(VenvLayout::default(), script.clone()));
    let envs = Arc::new(EnvironmentManager::new(probe, script.clone(), "python3"));
    ProjectRunner::new(
        envs,
        script,
        RunnerOptions {
            fallback_python,
            stop_timeout,
            capture_output: true,
        },
    )
}

fn answer(req: &CommandRequest) -> i32 {
    if is_venv_create(req) {
        create_requested_venv(req)
    } else {
        0
    }
}

fn project_dir(root: &Path, name: &str, with_requirements: bool) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("main.py"), "print('hello')\n").unwrap();
    if with_requirements {
        std::fs::write(dir.join("requirements.txt"), "requests\n").unwrap();
    }
    dir
}

fn open(dir: &Path) -> Project {
    Project::open(dir.to_path_buf(), false, &VenvLayout::default())
}

async fn wait_for_line(
    rx: &mut UnboundedReceiver<LauncherEvent>,
    pred: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut seen = Vec::new();
    for _ in 0..50 {
        seen.extend(log_lines(rx));
        if seen.iter().any(|l| pred(l)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    seen
}

#[tokio::test]
async fn fresh_project_creates_installs_and_launches() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "webapp", true);
    let project = open(&dir);
    let script = ScriptedRunner::new(answer);
    let runner = supervisor(script.clone(), Duration::from_secs(5));
    let (sink, _rx) = EventSink::channel();
    let log = sink.for_project(project.name());

    let pid = runner.start(&project, &log).await.unwrap();

    assert_eq!(project.status(), ProjectStatus::Running { pid });
    assert!(project.status().to_string().starts_with("Running (pid="));
    assert!(project.fresh_venv());
    assert!(project.marker_path().exists());
    assert_eq!(script.count(is_venv_create), 1);
    assert_eq!(script.count(is_pip_install), 1);
    assert!(project.is_running());

    assert_eq!(runner.stop(&project, &log).await, StopOutcome::Stopped);
    assert_eq!(project.status(), ProjectStatus::Stopped);
    assert!(!project.is_running());
}

#[tokio::test]
async fn broken_home_is_backed_up_then_run_proceeds() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "legacy", true);
    create_fake_venv(&dir.join(".venv"), Some(&tmp.path().join("deleted-python")));
    let project = open(&dir);
    let script = ScriptedRunner::new(answer);
    let runner = supervisor(script.clone(), Duration::from_secs(5));
    let (sink, mut rx) = EventSink::channel();
    let log = sink.for_project(project.name());

    let pid = runner.start(&project, &log).await.unwrap();

    assert!(dir.join(".venv.broken_backup").join("pyvenv.cfg").exists());
    assert!(dir.join(".venv").join("bin").join("python").exists());
    assert_eq!(script.count(is_venv_create), 1);
    assert_eq!(project.status(), ProjectStatus::Running { pid });
    let lines = log_lines(&mut rx);
    assert!(lines.iter().any(|l| l.starts_with("Backed up broken venv to: ")));

    runner.stop(&project, &log).await;
}

#[tokio::test]
async fn install_recovers_after_upgrade() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "flaky", true);
    let installs = AtomicUsize::new(0);
    let script = ScriptedRunner::new(move |req| {
        if is_pip_install(req) && installs.fetch_add(1, Ordering::SeqCst) == 0 {
            1
        } else {
            answer(req)
        }
    });
    let project = open(&dir);
    let runner = supervisor(script.clone(), Duration::from_secs(5));
    let (sink, mut rx) = EventSink::channel();
    let log = sink.for_project(project.name());

    let pid = runner.start(&project, &log).await.unwrap();

    assert!(project.marker_path().exists());
    assert_eq!(project.status(), ProjectStatus::Running { pid });
    assert_eq!(script.count(is_pip_install), 2);
    assert_eq!(script.count(is_pip_upgrade), 1);
    let lines = log_lines(&mut rx);
    let attempts = lines
        .iter()
        .filter(|l| l.starts_with("$ ") && l.contains(" -r "))
        .count();
    assert_eq!(attempts, 2);
    assert!(lines.iter().any(|l| l == "Requirements installed on retry."));

    runner.stop(&project, &log).await;
}

#[tokio::test]
async fn force_rebuild_replaces_healthy_venv() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "healthy", false);
    create_fake_venv(&dir.join(".venv"), Some(tmp.path()));
    std::fs::write(dir.join(".venv").join("sentinel"), "old").unwrap();
    let project = open(&dir);
    let script = ScriptedRunner::new(answer);
    let runner = supervisor(script.clone(), Duration::from_secs(5));
    let (sink, _rx) = EventSink::channel();
    let log = sink.for_project(project.name());

    let outcome = runner.rebuild(&project, &log).await.unwrap();

    assert!(matches!(outcome, EnsureOutcome::Created(_)));
    assert_eq!(project.status(), ProjectStatus::VenvRebuilt);
    assert!(dir.join(".venv.broken_backup").join("sentinel").exists());
    assert!(!dir.join(".venv").join("sentinel").exists());
    assert_eq!(script.count(is_version_check), 0);
    assert_eq!(script.count(is_venv_create), 1);
}

#[tokio::test]
async fn rebuild_failure_sets_status() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "nobase", false);
    let project = open(&dir);
    let script = ScriptedRunner::new(|req| if is_venv_create(req) { 127 } else { 0 });
    let runner = supervisor(script, Duration::from_secs(5));
    let (sink, _rx) = EventSink::channel();

    let err = runner
        .rebuild(&project, &sink.for_project(project.name()))
        .await
        .unwrap_err();
    assert!(matches!(err, LauncherError::VenvCreate(127)));
    assert_eq!(project.status(), ProjectStatus::VenvRebuildFailed);
}

#[tokio::test]
async fn valid_root_venv_needs_no_creation() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "ready", false);
    create_fake_venv(&dir.join(".venv"), Some(tmp.path()));
    let project = open(&dir);
    let script = ScriptedRunner::new(answer);
    let runner = supervisor(script.clone(), Duration::from_secs(5));
    let (sink, _rx) = EventSink::channel();
    let log = sink.for_project(project.name());

    runner.start(&project, &log).await.unwrap();
    assert_eq!(script.count(is_venv_create), 0);
    assert!(!project.fresh_venv());

    runner.stop(&project, &log).await;
}

#[tokio::test]
async fn stop_without_child_is_idle_and_spawns_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "idle", false);
    let project = open(&dir);
    let script = ScriptedRunner::new(answer);
    let runner = supervisor(script.clone(), Duration::from_secs(5));
    let (sink, _rx) = EventSink::channel();

    let outcome = runner.stop(&project, &sink.for_project(project.name())).await;
    assert_eq!(outcome, StopOutcome::Idle);
    assert_eq!(project.status(), ProjectStatus::Idle);
    assert!(script.calls().is_empty());
}

#[tokio::test]
async fn stubborn_child_is_killed_after_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "stubborn", false);
    create_fake_venv_with(
        &dir.join(".venv"),
        Some(tmp.path()),
        "trap '' TERM\nwhile :; do sleep 1; done",
    );
    let project = open(&dir);
    let runner = supervisor(ScriptedRunner::new(answer), Duration::from_millis(300));
    let (sink, _rx) = EventSink::channel();
    let log = sink.for_project(project.name());

    runner.start(&project, &log).await.unwrap();
    // Let the shell install its trap before signalling
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(runner.stop(&project, &log).await, StopOutcome::Killed);
    assert_eq!(project.status(), ProjectStatus::Killed);
}

#[tokio::test]
async fn exited_child_is_reconciled() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "oneshot", false);
    create_fake_venv_with(&dir.join(".venv"), Some(tmp.path()), "exit 0");
    let project = open(&dir);
    let runner = supervisor(ScriptedRunner::new(answer), Duration::from_secs(5));
    let (sink, _rx) = EventSink::channel();
    let log = sink.for_project(project.name());

    runner.start(&project, &log).await.unwrap();
    for _ in 0..50 {
        if project.has_exited() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(project.has_exited());
    assert!(reconcile(&project, &log));
    assert_eq!(project.status(), ProjectStatus::Exited);
    assert!(!reconcile(&project, &log));

    assert_eq!(runner.stop(&project, &log).await, StopOutcome::Idle);
}

#[tokio::test]
async fn args_and_output_reach_the_log() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "echoer", false);
    create_fake_venv_with(&dir.join(".venv"), Some(tmp.path()), "echo \"$@\"\nexit 0");
    let project = open(&dir);
    project.set_args("--port 8000");
    let runner = supervisor(ScriptedRunner::new(answer), Duration::from_secs(5));
    let (sink, mut rx) = EventSink::channel();
    let log = sink.for_project(project.name());

    runner.start(&project, &log).await.unwrap();

    let lines = wait_for_line(&mut rx, |l| l.ends_with("main.py --port 8000")).await;
    assert!(lines.iter().any(|l| l.ends_with("main.py --port 8000")));
}

#[tokio::test]
async fn missing_entrypoint_needs_user_input() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("empty");
    std::fs::create_dir(&dir).unwrap();
    let project = open(&dir);
    let script = ScriptedRunner::new(answer);
    let runner = supervisor(script.clone(), Duration::from_secs(5));
    let (sink, _rx) = EventSink::channel();

    let err = runner
        .start(&project, &sink.for_project(project.name()))
        .await
        .unwrap_err();
    assert!(matches!(err, LauncherError::NeedEntrypoint));
    assert_eq!(project.status(), ProjectStatus::NeedEntrypoint);
    assert!(script.calls().is_empty());
}

#[tokio::test]
async fn configured_entrypoint_must_exist() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "typo", false);
    create_fake_venv(&dir.join(".venv"), Some(tmp.path()));
    let project = open(&dir);
    project.set_entrypoint(Some("mian.py".into()));
    let runner = supervisor(ScriptedRunner::new(answer), Duration::from_secs(5));
    let (sink, _rx) = EventSink::channel();

    let err = runner
        .start(&project, &sink.for_project(project.name()))
        .await
        .unwrap_err();
    assert!(matches!(err, LauncherError::MissingEntrypoint(ref e) if e == "mian.py"));
    assert_eq!(project.status(), ProjectStatus::MissingEntrypoint);
}

#[tokio::test]
async fn venv_creation_failure_is_venv_error() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "nopython", true);
    let project = open(&dir);
    let script = ScriptedRunner::new(|req| if is_venv_create(req) { 127 } else { 0 });
    let runner = supervisor(script.clone(), Duration::from_secs(5));
    let (sink, _rx) = EventSink::channel();

    runner
        .start(&project, &sink.for_project(project.name()))
        .await
        .unwrap_err();
    assert_eq!(project.status(), ProjectStatus::VenvError);
    assert_eq!(script.count(is_pip_install), 0);
}

#[tokio::test]
async fn install_failure_blocks_launch() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "broken-deps", true);
    create_fake_venv(&dir.join(".venv"), Some(tmp.path()));
    let project = open(&dir);
    let script = ScriptedRunner::new(|req| if is_pip_install(req) { 1 } else { 0 });
    let runner = supervisor(script.clone(), Duration::from_secs(5));
    let (sink, _rx) = EventSink::channel();

    let err = runner
        .start(&project, &sink.for_project(project.name()))
        .await
        .unwrap_err();
    assert!(matches!(err, LauncherError::Install(1)));
    assert_eq!(project.status(), ProjectStatus::InstallFailed);
    assert!(!project.is_running());
    assert_eq!(script.count(is_pip_install), 2);
}

#[tokio::test]
async fn unexecutable_interpreter_is_launch_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "noexec", false);
    let python = VenvLayout::default().interpreter_in(&dir.join(".venv"));
    std::fs::create_dir_all(python.parent().unwrap()).unwrap();
    std::fs::write(&python, "not a program").unwrap();
    let project = open(&dir);
    let runner = supervisor(ScriptedRunner::new(answer), Duration::from_secs(5));
    let (sink, _rx) = EventSink::channel();

    let err = runner
        .start(&project, &sink.for_project(project.name()))
        .await
        .unwrap_err();
    assert!(matches!(err, LauncherError::Launch(_)));
    assert_eq!(project.status(), ProjectStatus::LaunchFailed);
}

#[tokio::test]
async fn fallback_interpreter_used_without_venv_python() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "fallback", false);
    let fallback = tmp.path().join("tools").join("python");
    write_script(&fallback, "exec sleep 30");
    // Creation "succeeds" without laying anything down
    let script = ScriptedRunner::new(|_| 0);
    let project = open(&dir);
    let runner = supervisor_with_fallback(script, Duration::from_secs(5), fallback);
    let (sink, mut rx) = EventSink::channel();
    let log = sink.for_project(project.name());

    let pid = runner.start(&project, &log).await.unwrap();
    assert_eq!(project.status(), ProjectStatus::Running { pid });
    assert!(log_lines(&mut rx).iter().any(|l| l == "Launched with python main.py"));

    assert_eq!(runner.stop(&project, &log).await, StopOutcome::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_waits_for_a_start_in_progress() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "slow", true);
    create_fake_venv(&dir.join(".venv"), Some(tmp.path()));
    let project = Arc::new(open(&dir));
    let script = ScriptedRunner::new(|req| {
        if is_pip_install(req) {
            std::thread::sleep(Duration::from_millis(400));
        }
        0
    });
    let runner = Arc::new(supervisor(script, Duration::from_secs(5)));
    let (sink, mut rx) = EventSink::channel();
    let log = sink.for_project(project.name());

    let start = tokio::spawn({
        let (runner, project, log) = (runner.clone(), project.clone(), log.clone());
        async move { runner.start(&project, &log).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!start.is_finished());

    // Stop only gets the guard once the launch is done, so there is a child to stop
    assert_eq!(runner.stop(&project, &log).await, StopOutcome::Stopped);
    start.await.unwrap().unwrap();

    let statuses: Vec<ProjectStatus> = drain_pending(&mut rx)
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::Status { status } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses.len(), 3, "{statuses:?}");
    assert_eq!(statuses[0], ProjectStatus::Preparing);
    assert!(matches!(statuses[1], ProjectStatus::Running { .. }));
    assert_eq!(statuses[2], ProjectStatus::Stopped);
}

#[tokio::test]
async fn launched_output_goes_to_a_file_and_survives_without_reader() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = project_dir(tmp.path(), "ticker", false);
    create_fake_venv_with(
        &dir.join(".venv"),
        Some(tmp.path()),
        "if [ -p /dev/stdout ]; then echo pipe > stdout_kind; else echo file > stdout_kind; fi\n\
         i=0; while :; do i=$((i+1)); echo \"tick $i\"; echo $i > alive; sleep 0.1; done",
    );
    let project = open(&dir);
    let runner = supervisor(ScriptedRunner::new(answer), Duration::from_secs(5));
    let (sink, mut rx) = EventSink::channel();
    let log = sink.for_project(project.name());

    runner.start(&project, &log).await.unwrap();
    let lines = wait_for_line(&mut rx, |l| l == "tick 1").await;
    assert!(lines.iter().any(|l| l == "tick 1"), "{lines:?}");
    assert_eq!(
        std::fs::read_to_string(dir.join("stdout_kind")).unwrap().trim(),
        "file"
    );

    // Nobody reads the output any more, as after the launcher exits
    drop(rx);
    project.end_output_tail();
    let read_alive = || {
        std::fs::read_to_string(dir.join("alive"))
            .unwrap()
            .trim()
            .parse::<u32>()
            .unwrap_or(0)
    };
    let before = read_alive();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(read_alive() > before);
    assert!(!project.has_exited());

    let captured = std::fs::read_to_string(project.output_log_path()).unwrap();
    assert!(captured.contains("tick"));

    assert_eq!(runner.stop(&project, &log).await, StopOutcome::Stopped);
}
