use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LauncherError;

const APP_DIR: &str = "pylauncher";
const FILE_NAME: &str = "settings.json";

/// User preferences persisted between sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub last_root: Option<PathBuf>,
    #[serde(default)]
    pub install_on_run: bool,
}

impl Settings {
    /// `<config_dir>/pylauncher/settings.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(FILE_NAME))
    }

    /// Read settings from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, LauncherError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Like [`Settings::load`] but never fails: unreadable or corrupt files
    /// are logged and replaced by defaults.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings");
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), LauncherError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;

        // Atomic write via temp file + rename
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, path)?;
        tracing::debug!(path = %path.display(), "settings saved");
        Ok(())
    }
}
