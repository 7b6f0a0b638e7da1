use std::path::Path;
use std::sync::Arc;

use crate::error::LauncherError;
use crate::venv::VenvLayout;

use super::Project;

/// Conventional entry scripts, in priority order.
pub const ENTRY_CANDIDATES: [&str; 5] = ["app.py", "main.py", "run.py", "server.py", "wsgi.py"];

/// Conventional requirements manifests, in priority order.
pub const REQUIREMENTS_CANDIDATES: [&str; 3] =
    ["requirements.txt", "requirement.txt", "requirements-dev.txt"];

/// Pick the entry script: a conventional name if present, else the first
/// `.py` file by name that isn't private (`_`) or hidden (`.`).
pub fn detect_entrypoint(dir: &Path) -> Option<String> {
    if let Some(found) = ENTRY_CANDIDATES.iter().find(|c| dir.join(c).exists()) {
        return Some(found.to_string());
    }

    let mut scripts: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".py") && !n.starts_with('_') && !n.starts_with('.'))
        .collect();
    scripts.sort();
    scripts.into_iter().next()
}

pub fn detect_requirements(dir: &Path) -> Option<String> {
    REQUIREMENTS_CANDIDATES
        .iter()
        .find(|c| dir.join(c).exists())
        .map(|c| c.to_string())
}

/// Build one project per immediate, non-hidden subdirectory of `root`,
/// sorted by name. Every call starts from scratch.
pub fn scan(
    root: &Path,
    install_on_run: bool,
    layout: &VenvLayout,
) -> Result<Vec<Arc<Project>>, LauncherError> {
    if !root.is_dir() {
        return Err(LauncherError::InvalidRoot(root.display().to_string()));
    }

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        dirs.push(entry.path());
    }
    dirs.sort();

    let projects: Vec<Arc<Project>> = dirs
        .into_iter()
        .map(|dir| Arc::new(Project::open(dir, install_on_run, layout)))
        .collect();

    tracing::info!(root = %root.display(), count = projects.len(), "scanned projects");
    Ok(projects)
}
