use std::io;

/// Errors from launcher operations.
///
/// Every variant is also reported as a line in the project's log and,
/// where it ends a run, as the project's status. Callers never need to
/// handle a panic or an unwinding failure from the core.
#[derive(thiserror::Error, Debug)]
pub enum LauncherError {
    #[error("no entrypoint set")]
    NeedEntrypoint,

    #[error("entrypoint not found: {0}")]
    MissingEntrypoint(String),

    #[error("venv creation failed: exit {0}")]
    VenvCreate(i32),

    #[error("requirements install failed: exit {0}")]
    Install(i32),

    #[error("pip upgrade failed: exit {0}")]
    Upgrade(i32),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("project not found: {0}")]
    NotFound(String),

    #[error("invalid root folder: {0}")]
    InvalidRoot(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for LauncherError {
    fn from(e: serde_json::Error) -> Self {
        LauncherError::Serde(e.to_string())
    }
}
