// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dd_supervisor::config;
use dd_supervisor::persist::{self, StateWriter};
use dd_supervisor::registry::Registry;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "dd-supervisord", version, about = "Single-host process supervisor")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "DD_LOG_LEVEL", default_value = "info", global = true, value_parser = parse_level)]
    log_level: log::Level,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise the configured apps until SIGTERM or SIGINT (default).
    Run(RunArgs),
    /// Load and validate the configuration, then print the resulting apps.
    Validate {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the snapshot written by a running daemon.
    Status {
        #[arg(long)]
        state_file: PathBuf,
        /// Print raw JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Ecosystem file or directory of per-app files. Defaults to
    /// $DD_SUPERVISOR_CONFIG, then /etc/datadog-agent/supervisor.yaml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a JSON status snapshot here after every lifecycle event.
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Overall bound on stopping every app at shutdown.
    #[arg(long, default_value = "30s", value_parser = parse_timeout)]
    shutdown_timeout: Duration,
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    config::parse_duration(s)
}

fn parse_level(s: &str) -> Result<log::Level, String> {
    s.parse().map_err(|_| format!("unknown log level {s:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    simple_logger::init_with_level(cli.log_level)?;

    match cli.command.unwrap_or(Command::Run(cli.run)) {
        Command::Run(args) => run(args).await,
        Command::Validate { config } => validate(config),
        Command::Status { state_file, json } => status(&state_file, json),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    info!(
        "dd-supervisord starting (version {})",
        env!("CARGO_PKG_VERSION")
    );

    let path = args.config.unwrap_or_else(config::config_path);
    let apps = config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    let descriptors = config::build_descriptors(apps)
        .with_context(|| format!("validating {}", path.display()))?;
    info!("loaded {} app(s) from {}", descriptors.len(), path.display());

    let registry = Arc::new(Registry::from_descriptors(descriptors)?);
    let cancel = CancellationToken::new();
    let writer = args
        .state_file
        .map(|p| StateWriter::spawn(p, Arc::clone(&registry), cancel.clone()));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let started = registry.start_all().await;
    info!("started {started} of {} app(s)", registry.len());

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("dd-supervisord shutting down");
    let killed = registry.shutdown(args.shutdown_timeout).await;
    if !killed.is_empty() {
        warn!("force killed after shutdown timeout: {}", killed.join(", "));
    }

    cancel.cancel();
    if let Some(writer) = writer {
        let _ = writer.await;
    }
    Ok(())
}

fn validate(path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(config::config_path);
    let apps = config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    let descriptors = config::build_descriptors(apps)
        .with_context(|| format!("validating {}", path.display()))?;
    for d in &descriptors {
        println!("{d}");
    }
    println!("config OK: {} app(s)", descriptors.len());
    Ok(())
}

fn status(state_file: &std::path::Path, json: bool) -> Result<()> {
    let snapshot = persist::read(state_file)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("{}", snapshot.render_table());
    }
    Ok(())
}
