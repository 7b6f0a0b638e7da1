use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::task::JoinHandle;

use crate::command::{CommandRunner, ProcessCommandRunner};
use crate::config::Config;
use crate::error::LauncherError;
use crate::events::EventSink;
use crate::project::{self, Project};
use crate::supervisor::{self, ProjectRunner, StopOutcome};
use crate::venv::{EnsureOutcome, EnvironmentManager, EnvironmentProbe, VenvLayout};

/// One launcher session: the scanned project set plus the machinery to
/// run, stop and rebuild projects in parallel.
///
/// Every per-project operation is its own tokio task, so a slow install
/// in one project never delays another. Progress arrives on the
/// [`EventSink`] given at construction.
pub struct Launcher {
    config: Config,
    events: EventSink,
    layout: VenvLayout,
    runner: Arc<ProjectRunner>,
    root: RwLock<Option<PathBuf>>,
    projects: RwLock<Vec<Arc<Project>>>,
    install_on_run: AtomicBool,
}

impl Launcher {
    pub fn new(config: Config, events: EventSink) -> Self {
        Self::with_runner(config, events, Arc::new(ProcessCommandRunner))
    }

    /// Build a launcher whose venv and pip commands go through `commands`.
    pub fn with_runner(config: Config, events: EventSink, commands: Arc<dyn CommandRunner>) -> Self {
        let layout = VenvLayout::default();
        let probe = Arc::new(EnvironmentProbe::new(layout.clone(), commands.clone()));
        let envs = Arc::new(EnvironmentManager::new(
            probe,
            commands.clone(),
            config.base_python.clone(),
        ));
        let runner = Arc::new(ProjectRunner::new(envs, commands, config.runner_options()));

        Self {
            install_on_run: AtomicBool::new(config.install_on_run),
            config,
            events,
            layout,
            runner,
            root: RwLock::new(None),
            projects: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn root(&self) -> Option<PathBuf> {
        self.root.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the project set with a fresh scan of `root`.
    pub fn scan(&self, root: &Path) -> Result<usize, LauncherError> {
        let found = project::scan(root, self.install_on_run(), &self.layout)?;
        let count = found.len();
        *self.projects.write().unwrap_or_else(PoisonError::into_inner) = found;
        *self.root.write().unwrap_or_else(PoisonError::into_inner) = Some(root.to_path_buf());
        Ok(count)
    }

    pub fn projects(&self) -> Vec<Arc<Project>> {
        self.projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Project>> {
        self.projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Resolve names to projects. An empty selection means all of them.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<Project>>, LauncherError> {
        if names.is_empty() {
            return Ok(self.projects());
        }
        names
            .iter()
            .map(|n| {
                self.get(n.as_ref())
                    .ok_or_else(|| LauncherError::NotFound(n.as_ref().to_string()))
            })
            .collect()
    }

    /// Set a project's entrypoint and/or arguments. A missing entry file is
    /// accepted with a warning; `start` reports it when it matters.
    pub fn configure(
        &self,
        name: &str,
        entrypoint: Option<&str>,
        args: Option<&str>,
    ) -> Result<(), LauncherError> {
        let project = self
            .get(name)
            .ok_or_else(|| LauncherError::NotFound(name.to_string()))?;
        let log = self.events.for_project(name);

        if let Some(entry) = entrypoint {
            let entry = entry.trim();
            project.set_entrypoint(Some(entry.to_string()));
            if !entry.is_empty() && !project.path().join(entry).exists() {
                log.line(format!(
                    "Warning: entrypoint '{entry}' does not exist in {}.",
                    project.path().display()
                ));
            }
        }
        if let Some(args) = args {
            project.set_args(args.trim());
        }
        Ok(())
    }

    pub fn install_on_run(&self) -> bool {
        self.install_on_run.load(Ordering::Relaxed)
    }

    /// Applies to every current project and to later scans.
    pub fn set_install_on_run(&self, value: bool) {
        self.install_on_run.store(value, Ordering::Relaxed);
        for project in self.projects() {
            project.set_install_on_run(value);
        }
    }

    pub fn run(&self, projects: &[Arc<Project>]) -> Vec<JoinHandle<Result<u32, LauncherError>>> {
        projects
            .iter()
            .map(|project| {
                let project = project.clone();
                let runner = self.runner.clone();
                let log = self.events.for_project(project.name());
                tokio::spawn(async move {
                    log.line(format!("--- {} ---", project.name()));
                    runner.start(&project, &log).await
                })
            })
            .collect()
    }

    pub fn stop(&self, projects: &[Arc<Project>]) -> Vec<JoinHandle<StopOutcome>> {
        projects
            .iter()
            .map(|project| {
                let project = project.clone();
                let runner = self.runner.clone();
                let log = self.events.for_project(project.name());
                tokio::spawn(async move { runner.stop(&project, &log).await })
            })
            .collect()
    }

    pub fn rebuild(
        &self,
        projects: &[Arc<Project>],
    ) -> Vec<JoinHandle<Result<EnsureOutcome, LauncherError>>> {
        projects
            .iter()
            .map(|project| {
                let project = project.clone();
                let runner = self.runner.clone();
                let log = self.events.for_project(project.name());
                tokio::spawn(async move {
                    log.line(format!("--- {}: rebuilding venv ---", project.name()));
                    runner.rebuild(&project, &log).await
                })
            })
            .collect()
    }

    /// Mark every project whose child has exited. Returns how many changed.
    pub fn sweep(&self) -> usize {
        self.projects()
            .iter()
            .filter(|p| supervisor::reconcile(p, &self.events.for_project(p.name())))
            .count()
    }

    /// Number of projects with a live child.
    pub fn running(&self) -> usize {
        self.projects().iter().filter(|p| p.is_running()).count()
    }
}
