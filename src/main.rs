use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pylauncher::config::parse_flag;
use pylauncher::events::drain_pending;
use pylauncher::{Config, EventKind, EventSink, Launcher, LauncherEvent, Settings};

/// Matches the log pane refresh of a desktop launcher.
const DRAIN_INTERVAL: Duration = Duration::from_millis(150);

#[derive(Parser)]
#[command(name = "pylauncher", about = "Run Python projects, each in its own venv")]
struct Cli {
    /// Folder whose subdirectories are projects
    #[arg(long)]
    root: Option<PathBuf>,
    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List discovered projects
    List,
    /// Prepare and launch projects (all when none are named)
    Run {
        names: Vec<String>,
        /// Override a project's entry script
        #[arg(long = "entry", value_name = "NAME=FILE", value_parser = parse_assignment)]
        entries: Vec<(String, String)>,
        /// Arguments passed to a project's entry script
        #[arg(long = "args", value_name = "NAME=ARGS", value_parser = parse_assignment, allow_hyphen_values = true)]
        args: Vec<(String, String)>,
        /// Reinstall requirements even when already installed
        #[arg(long)]
        always_install: bool,
        /// Exit right after launching
        #[arg(long)]
        detach: bool,
    },
    /// Back up and recreate project venvs
    Rebuild { names: Vec<String> },
    /// Show or update persisted settings
    Settings {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long, value_parser = parse_bool)]
        install_on_run: Option<bool>,
    },
}

fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    if name.trim().is_empty() {
        return Err(format!("missing project name in '{raw}'"));
    }
    Ok((name.trim().to_string(), value.to_string()))
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    parse_flag(raw).ok_or_else(|| format!("expected true/false, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pylauncher=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_writer(std::io::stderr)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            enable_logs: true,
            ..Default::default()
        },
    ));

    let settings_path = Settings::default_path();
    let mut settings = settings_path
        .as_deref()
        .map(Settings::load_or_default)
        .unwrap_or_default();

    match cli.command {
        Command::Settings {
            root,
            install_on_run,
        } => {
            let changed = root.is_some() || install_on_run.is_some();
            if let Some(root) = root {
                settings.last_root = Some(root);
            }
            if let Some(value) = install_on_run {
                settings.install_on_run = value;
            }
            if changed {
                let path = settings_path.context("no config directory on this platform")?;
                settings.save(&path)?;
            }
            print_settings(&settings, cli.json)?;
            Ok(())
        }
        Command::List => {
            let (launcher, _printer) =
                open_session(cli.root, cli.json, &config, &mut settings, settings_path.as_deref())?;
            list(&launcher, cli.json)
        }
        Command::Run {
            names,
            entries,
            args,
            always_install,
            detach,
        } => {
            let (launcher, mut printer) =
                open_session(cli.root, cli.json, &config, &mut settings, settings_path.as_deref())?;
            if always_install {
                launcher.set_install_on_run(true);
            }
            for (name, entry) in &entries {
                launcher.configure(name, Some(entry), None)?;
            }
            for (name, value) in &args {
                launcher.configure(name, None, Some(value))?;
            }
            run(&launcher, &names, detach, &mut printer).await
        }
        Command::Rebuild { names } => {
            let (launcher, mut printer) =
                open_session(cli.root, cli.json, &config, &mut settings, settings_path.as_deref())?;
            rebuild(&launcher, &names, &mut printer).await
        }
    }
}

/// Resolve the projects root (flag, then env, then saved), scan it and
/// remember it for next time.
fn open_session(
    cli_root: Option<PathBuf>,
    json: bool,
    config: &Config,
    settings: &mut Settings,
    settings_path: Option<&Path>,
) -> Result<(Launcher, Printer)> {
    let root = cli_root
        .or_else(|| config.root.clone())
        .or_else(|| settings.last_root.clone())
        .context("no projects folder: pass --root, set LAUNCHER_ROOT, or save one with `settings --root`")?;

    let (events, rx) = EventSink::channel();
    let launcher = Launcher::new(config.clone(), events);
    let count = launcher
        .scan(&root)
        .with_context(|| format!("failed to scan {}", root.display()))?;
    tracing::info!(root = %root.display(), count, "session ready");
    remember_root(settings, settings_path, &root);
    launcher.set_install_on_run(config.install_on_run || settings.install_on_run);

    Ok((launcher, Printer { json, rx }))
}

fn remember_root(settings: &mut Settings, path: Option<&Path>, root: &Path) {
    if settings.last_root.as_deref() == Some(root) {
        return;
    }
    settings.last_root = Some(root.to_path_buf());
    if let Some(path) = path {
        if let Err(e) = settings.save(path) {
            tracing::warn!(error = %e, "failed to persist projects root");
        }
    }
}

async fn run(launcher: &Launcher, names: &[String], detach: bool, printer: &mut Printer) -> Result<()> {
    let selection = launcher.select(names)?;
    let starts = futures::future::join_all(launcher.run(&selection));
    tokio::pin!(starts);
    let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let results = loop {
        tokio::select! {
            results = &mut starts => break results,
            _ = ticker.tick() => printer.flush()?,
            _ = &mut ctrl_c => {
                // Starts in flight hold the per-project guard; stop waits for them
                stop_all(launcher, printer).await?;
                return Ok(());
            }
        }
    };
    printer.flush()?;

    let failed = results
        .iter()
        .filter(|r| !matches!(r, Ok(Ok(_))))
        .count();
    let launched = results.len() - failed;

    if !detach && launched > 0 {
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    launcher.sweep();
                    printer.flush()?;
                    if launcher.running() == 0 {
                        break;
                    }
                }
                _ = &mut ctrl_c => {
                    stop_all(launcher, printer).await?;
                    break;
                }
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} project(s) failed to start", results.len());
    }
    Ok(())
}

async fn stop_all(launcher: &Launcher, printer: &mut Printer) -> Result<()> {
    tracing::info!(running = launcher.running(), "interrupted, stopping projects");
    futures::future::join_all(launcher.stop(&launcher.projects())).await;
    printer.flush()
}

async fn rebuild(launcher: &Launcher, names: &[String], printer: &mut Printer) -> Result<()> {
    let selection = launcher.select(names)?;
    let rebuilds = futures::future::join_all(launcher.rebuild(&selection));
    tokio::pin!(rebuilds);
    let mut ticker = tokio::time::interval(DRAIN_INTERVAL);

    let results = loop {
        tokio::select! {
            results = &mut rebuilds => break results,
            _ = ticker.tick() => printer.flush()?,
        }
    };
    printer.flush()?;

    let failed = results
        .iter()
        .filter(|r| !matches!(r, Ok(Ok(_))))
        .count();
    if failed > 0 {
        bail!("{failed} of {} rebuild(s) failed", results.len());
    }
    Ok(())
}

#[derive(Serialize)]
struct ProjectRow {
    name: String,
    entrypoint: Option<String>,
    requirements: Option<String>,
    venv: Option<PathBuf>,
    status: String,
}

fn list(launcher: &Launcher, json: bool) -> Result<()> {
    let rows: Vec<ProjectRow> = launcher
        .projects()
        .iter()
        .map(|p| ProjectRow {
            name: p.name().to_string(),
            entrypoint: p.entrypoint(),
            requirements: p.requirements().map(String::from),
            venv: p
                .venv_python()
                .and_then(|py| py.strip_prefix(p.path()).ok().map(Path::to_path_buf)),
            status: p.status().to_string(),
        })
        .collect();

    if json {
        for row in &rows {
            println!("{}", serde_json::to_string(row)?);
        }
        return Ok(());
    }

    let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(4).max(4);
    println!("{:<width$}  {:<14}  {:<22}  {:<20}  STATUS", "NAME", "ENTRY", "REQUIREMENTS", "VENV");
    for row in &rows {
        println!(
            "{:<width$}  {:<14}  {:<22}  {:<20}  {}",
            row.name,
            row.entrypoint.as_deref().unwrap_or("-"),
            row.requirements.as_deref().unwrap_or("-"),
            row.venv
                .as_ref()
                .map(|v| v.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            row.status,
        );
    }
    Ok(())
}

fn print_settings(settings: &Settings, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(settings)?);
    } else {
        println!(
            "root: {}",
            settings
                .last_root
                .as_ref()
                .map(|r| r.display().to_string())
                .unwrap_or_else(|| "(not set)".to_string())
        );
        println!("install_on_run: {}", settings.install_on_run);
    }
    Ok(())
}

struct Printer {
    json: bool,
    rx: UnboundedReceiver<LauncherEvent>,
}

impl Printer {
    fn flush(&mut self) -> Result<()> {
        for event in drain_pending(&mut self.rx) {
            if self.json {
                println!("{}", serde_json::to_string(&event)?);
                continue;
            }
            match &event.kind {
                EventKind::Log { line } => println!("[{}] {line}", event.project),
                EventKind::Status { status } => println!("[{}] status: {status}", event.project),
            }
        }
        Ok(())
    }
}
