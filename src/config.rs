use std::path::PathBuf;
use std::time::Duration;

use crate::supervisor::RunnerOptions;

#[cfg(windows)]
pub const DEFAULT_PYTHON: &str = "python";
#[cfg(not(windows))]
pub const DEFAULT_PYTHON: &str = "python3";

const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;

/// Launcher configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: Option<PathBuf>,
    /// Creates venvs; also the fallback interpreter for launches.
    pub base_python: PathBuf,
    pub install_on_run: bool,
    pub stop_timeout: Duration,
    pub capture_output: bool,
    pub sentry_dsn: Option<String>,
    pub environment: String,
}

/// Raw environment values, one field per variable.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawValues<'a> {
    pub root: Option<&'a str>,
    pub python: Option<&'a str>,
    pub install_on_run: Option<&'a str>,
    pub stop_timeout_secs: Option<&'a str>,
    pub capture_output: Option<&'a str>,
    pub sentry_dsn: Option<&'a str>,
    pub environment: Option<&'a str>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw_values(RawValues::default())
    }
}

impl Config {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok();
        let root = var("LAUNCHER_ROOT");
        let python = var("LAUNCHER_PYTHON");
        let install_on_run = var("LAUNCHER_INSTALL_ON_RUN");
        let stop_timeout_secs = var("LAUNCHER_STOP_TIMEOUT_SECS");
        let capture_output = var("LAUNCHER_CAPTURE_OUTPUT");
        let sentry_dsn = var("SENTRY_DSN");
        let environment = var("ENVIRONMENT");

        Self::from_raw_values(RawValues {
            root: root.as_deref(),
            python: python.as_deref(),
            install_on_run: install_on_run.as_deref(),
            stop_timeout_secs: stop_timeout_secs.as_deref(),
            capture_output: capture_output.as_deref(),
            sentry_dsn: sentry_dsn.as_deref(),
            environment: environment.as_deref(),
        })
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(raw: RawValues<'_>) -> Self {
        let non_empty = |v: Option<&str>| v.map(str::trim).filter(|s| !s.is_empty()).map(String::from);

        let stop_timeout = raw
            .stop_timeout_secs
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_STOP_TIMEOUT_SECS);

        Config {
            root: non_empty(raw.root).map(PathBuf::from),
            base_python: non_empty(raw.python)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PYTHON)),
            install_on_run: raw.install_on_run.and_then(parse_flag).unwrap_or(false),
            stop_timeout: Duration::from_secs(stop_timeout),
            capture_output: raw.capture_output.and_then(parse_flag).unwrap_or(cfg!(unix)),
            sentry_dsn: non_empty(raw.sentry_dsn),
            environment: non_empty(raw.environment).unwrap_or_else(|| "local".to_string()),
        }
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            fallback_python: self.base_python.clone(),
            stop_timeout: self.stop_timeout,
            capture_output: self.capture_output,
        }
    }
}

/// `1/true/yes/on` and `0/false/no/off`, case-insensitive. Anything else
/// (including empty) is unset.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
