//! uptrail - uptime monitoring engine
//!
//! Periodically checks HTTP, ping, TCP, PostgreSQL and Oracle targets, tracks incidents
//! and keeps daily uptime statistics for a status dashboard.

mod config;
mod db;
mod monitor;
mod probe;
mod scheduler;

use config::EngineConfig;
use db::{FieldCipher, HistoryStore, Store, TargetStore};
use monitor::{classify, sanitize_message, DayHealth, Monitor, StatsAggregator, UptimeSummary};
use probe::ProbeExecutor;
use scheduler::Scheduler;

use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring engine (default).
    Run,
    /// Probe one target once and print the result without recording it.
    Check {
        /// Id of the target to probe.
        target_id: String,
    },
    /// Print uptime, average latency and a daily timeline for every target.
    Stats {
        /// Lookback window in days (defaults to UPTRAIL_STATS_DAYS).
        #[arg(long)]
        days: Option<u32>,
        /// Print one JSON object per target instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Recompute daily statistics from the check log.
    RebuildStats,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Ignoring unreadable .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("uptrail=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = EngineConfig::load();
    tracing::debug!("Loaded configuration: {:?}", cfg);

    let mut store = Store::new(&cfg.db_path)?.with_notification_limit(cfg.notification_limit);
    match cfg.encryption_key.as_deref().map(FieldCipher::from_hex_key) {
        Some(Ok(cipher)) => store = store.with_cipher(cipher),
        Some(Err(e)) => tracing::warn!("Encrypted target addresses will not be decrypted: {}", e),
        None => {}
    }
    let store = Arc::new(store);
    tracing::info!("Using database at {}", cfg.db_path);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cfg, store).await,
        Commands::Check { target_id } => check(&cfg, &store, &target_id).await,
        Commands::Stats { days, json } => stats(store, days.unwrap_or(cfg.stats_days), json),
        Commands::RebuildStats => {
            let written = StatsAggregator::new(store).rebuild()?;
            println!("Rebuilt {} daily stat rows", written);
            Ok(())
        }
    }
}

async fn run(cfg: &EngineConfig, store: Arc<Store>) -> Result<(), BoxError> {
    let executor = ProbeExecutor::new(cfg.default_timeout)?;
    let monitor = Arc::new(Monitor::new(
        executor,
        Arc::clone(&store) as Arc<dyn HistoryStore>,
    )?);

    let scheduler = Scheduler::new(Arc::clone(&store) as Arc<dyn TargetStore>, monitor)
        .with_tick(cfg.tick)
        .with_refresh(cfg.refresh);

    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn check(cfg: &EngineConfig, store: &Store, target_id: &str) -> Result<(), BoxError> {
    let target = store.get_target(target_id)?;
    let executor = ProbeExecutor::new(cfg.default_timeout)?;

    let result = classify(
        executor.probe(&target).await,
        target.latency_threshold_ms,
    );
    let message = result
        .message
        .as_deref()
        .map(|m| sanitize_message(m, !target.show_target))
        .unwrap_or_default();

    println!(
        "{} [{}] {} {}ms {}{}",
        target.name,
        target.probe_type,
        result.status,
        result.latency_ms,
        result
            .status_code
            .map(|code| format!("HTTP {} ", code))
            .unwrap_or_default(),
        message
    );
    Ok(())
}

#[derive(Serialize)]
struct TargetReport<'a> {
    id: &'a str,
    name: &'a str,
    description: Option<&'a str>,
    public: bool,
    #[serde(flatten)]
    summary: UptimeSummary,
    timeline: Vec<(NaiveDate, DayHealth)>,
}

fn stats(store: Arc<Store>, days: u32, json: bool) -> Result<(), BoxError> {
    let targets = store.list_targets()?;
    let aggregator = StatsAggregator::new(store);
    let today = Local::now().date_naive();

    for target in &targets {
        let report = TargetReport {
            id: &target.id,
            name: &target.name,
            description: target.description.as_deref(),
            public: target.is_public,
            summary: aggregator.summary(&target.id, today, days)?,
            timeline: aggregator.timeline(&target.id, today, days)?,
        };

        if json {
            println!("{}", serde_json::to_string(&report)?);
            continue;
        }

        let timeline: String = report
            .timeline
            .iter()
            .map(|(_, health)| match health {
                DayHealth::Up => '+',
                DayHealth::Degraded => '~',
                DayHealth::Down => '-',
                DayHealth::Empty => '.',
            })
            .collect();

        println!(
            "{:<24} {:>7.2}% {:>6}ms {:>7} checks  {}",
            report.name,
            report.summary.uptime_pct,
            report.summary.avg_latency_ms,
            report.summary.checks,
            timeline
        );
    }
    Ok(())
}
