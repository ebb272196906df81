//! # job_pulse
//!
//! Runs an external job-listing scraper on a per-source cooldown schedule and
//! reconciles what it returns into a SQLite store of deduplicated listings.
//!
//! ## Usage
//!
//! ```sh
//! job_pulse run --source linkedin --keyword firmware
//! job_pulse daemon --source all
//! job_pulse status --source stepstone
//! ```
//!
//! ## Architecture
//!
//! Every cycle follows the same path through [`workflow::WorkflowCoordinator`]:
//! 1. **Gate**: refuse sources still inside their cooldown window
//! 2. **Reserve**: open a `running` record per source (at most one per source)
//! 3. **Invoke**: spawn the scraper and parse its single JSON document
//! 4. **Reconcile**: upsert listings by URL and recompute freshness
//! 5. **Close**: mark each record completed or failed, then arm the next timer

use clap::Parser;
use futures::future::join_all;
use std::error::Error;
use std::process::ExitCode;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

mod cli;
mod config;
mod cooldown;
mod db;
mod error;
mod ingest;
mod ledger;
mod models;
mod scheduler;
mod scraper;
mod utils;
mod workflow;

use cli::{Cli, Command};
use config::PipelineConfig;
use db::Database;
use scraper::process::ProcessInvoker;
use workflow::WorkflowCoordinator;

const DEFAULT_CONFIG_PATH: &str = "job_pulse.yaml";

type Coordinator = std::sync::Arc<WorkflowCoordinator<ProcessInvoker>>;

#[tokio::main]
#[instrument]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");

    let (path, required) = match &args.config {
        Some(path) => (path.as_str(), true),
        None => (DEFAULT_CONFIG_PATH, false),
    };
    let mut config = PipelineConfig::load(path, required).await.inspect_err(|e| {
        error!(error = %e, "Failed to load configuration");
    })?;
    args.apply_overrides(&mut config);
    config.validate()?;

    let db = Database::connect(&config.database_url).await.inspect_err(|e| {
        error!(error = %e, database_url = %config.database_url, "Failed to open database");
    })?;
    let invoker = ProcessInvoker::from_config(&config.scraper);
    let coordinator = WorkflowCoordinator::new(db.pool().clone(), invoker, &config);

    match args.command {
        Command::Run { source, keyword } => {
            let response = coordinator.trigger_run(source, keyword.as_deref()).await;
            // A one-shot process cannot keep the follow-up timer alive.
            coordinator.clear_schedules();
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.accepted {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Daemon { source, keyword } => {
            run_daemon(&coordinator, source, keyword).await?;
        }
        Command::Status { source } => {
            let status = coordinator.get_status(source).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Runs { source, limit } => {
            let runs = coordinator.recent_runs(source, limit).await?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
        Command::Listings { source, fresh, limit } => {
            let listings = coordinator.listings(source, fresh, limit).await?;
            println!("{}", serde_json::to_string_pretty(&listings)?);
        }
        Command::Sweep => {
            let swept = coordinator.sweep().await?;
            println!("{}", serde_json::json!({ "swept": swept }));
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Restore timers, optionally run the requested sources once, then idle until Ctrl-C.
async fn run_daemon(
    coordinator: &Coordinator,
    sources: Vec<models::Source>,
    keyword: Option<String>,
) -> Result<(), Box<dyn Error>> {
    coordinator.clear_schedules();

    let swept = coordinator.sweep().await?;
    let restored = coordinator.restore_schedules().await?;
    info!(swept, restored, "Scheduler started");

    let initial = join_all(
        sources
            .iter()
            .map(|source| coordinator.trigger_run(*source, keyword.as_deref())),
    )
    .await;
    for (source, response) in sources.iter().zip(initial) {
        if response.accepted {
            info!(%source, stats = ?response.stats, "Initial run finished");
        } else {
            warn!(%source, reason = ?response.reason, "Initial run not accepted");
        }
    }

    for timer in coordinator.armed_schedules() {
        info!(source = %timer.key.source, keyword = %timer.key.keyword, due_at = %timer.due_at, "Pending schedule");
    }

    tokio::signal::ctrl_c().await?;
    let cleared = coordinator.clear_schedules();
    info!(cleared, "Shutdown requested; pending schedules cancelled");
    Ok(())
}
