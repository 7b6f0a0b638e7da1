//! Discovers Python projects under a root folder, keeps a venv per project
//! healthy, installs requirements and supervises the launched scripts.

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod install;
pub mod launcher;
pub mod project;
pub mod settings;
pub mod supervisor;
pub mod venv;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::LauncherError;
pub use events::{EventKind, EventSink, LauncherEvent, ProjectLog};
pub use launcher::Launcher;
pub use project::{Project, ProjectStatus};
pub use settings::Settings;
