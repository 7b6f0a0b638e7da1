pub mod manager;
pub mod probe;

use std::path::{Path, PathBuf};

pub use manager::{BACKUP_SUFFIX, EnsureOutcome, EnvironmentManager, backup_destination, backup_dir};
pub use probe::{EnvironmentProbe, read_declared_home};

/// Conventional venv directory names, in priority order.
pub const VENV_NAMES: [&str; 3] = [".venv", "venv", "env"];

/// The venv's self-description file.
pub const PYVENV_CFG: &str = "pyvenv.cfg";

#[cfg(windows)]
const INTERPRETER_SUBPATH: &str = "Scripts/python.exe";
#[cfg(not(windows))]
const INTERPRETER_SUBPATH: &str = "bin/python";

/// Where venvs live inside a project and where their interpreter lives
/// inside a venv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenvLayout {
    pub names: Vec<String>,
    pub interpreter: PathBuf,
}

impl Default for VenvLayout {
    fn default() -> Self {
        Self {
            names: VENV_NAMES.iter().map(|n| n.to_string()).collect(),
            interpreter: PathBuf::from(INTERPRETER_SUBPATH),
        }
    }
}

impl VenvLayout {
    /// Directory a fresh root venv is created in (the first alias).
    pub fn target_dir(&self, project_dir: &Path) -> PathBuf {
        let name = self.names.first().map(String::as_str).unwrap_or(VENV_NAMES[0]);
        project_dir.join(name)
    }

    pub fn interpreter_in(&self, venv_dir: &Path) -> PathBuf {
        venv_dir.join(&self.interpreter)
    }

    /// Recover the venv directory from an interpreter path.
    pub fn venv_root_of(&self, interpreter: &Path) -> Option<PathBuf> {
        let depth = self.interpreter.components().count();
        let mut root = interpreter;
        for _ in 0..depth {
            root = root.parent()?;
        }
        Some(root.to_path_buf())
    }

    /// Every venv directory directly under the project, in alias order,
    /// whether or not its interpreter is present.
    pub fn root_dirs(&self, project_dir: &Path) -> Vec<PathBuf> {
        self.names
            .iter()
            .map(|n| project_dir.join(n))
            .filter(|d| d.is_dir())
            .collect()
    }

    /// Interpreter of the first root-level venv whose interpreter exists.
    pub fn find_root(&self, project_dir: &Path) -> Option<PathBuf> {
        self.names
            .iter()
            .map(|n| self.interpreter_in(&project_dir.join(n)))
            .find(|p| p.exists())
    }

    /// One level down: the first non-hidden subdirectory holding a venv.
    /// Subdirectories are visited in name order.
    pub fn find_shallow(&self, project_dir: &Path) -> Option<PathBuf> {
        let mut subdirs: Vec<PathBuf> = std::fs::read_dir(project_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .map(|e| e.path())
            .collect();
        subdirs.sort();

        subdirs.iter().find_map(|sub| {
            self.names
                .iter()
                .map(|n| self.interpreter_in(&sub.join(n)))
                .find(|p| p.exists())
        })
    }

    /// Root venv if present, otherwise a shallow one.
    pub fn detect(&self, project_dir: &Path) -> Option<PathBuf> {
        self.find_root(project_dir)
            .or_else(|| self.find_shallow(project_dir))
    }
}
