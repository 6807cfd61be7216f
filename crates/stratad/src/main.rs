//! stratad — the Strata daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Endpoint registry
//! - Orchestrator (deployments, tenants, backups)
//! - Scheduler (backups, TTLs, scaling plans, retention)
//! - Health monitor
//!
//! # Usage
//!
//! ```text
//! stratad standalone --data-dir /var/lib/strata
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use strata_engine::{FakeSubstrate, StaticTemplateProvider};
use strata_orchestrator::{Orchestrator, OrchestratorConfig};
use strata_registry::{BreakerConfig, Registry};
use strata_scheduler::{Scheduler, SchedulerConfig};
use strata_state::StateStore;

#[derive(Parser)]
#[command(name = "stratad", about = "Strata daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single node, in-process fake substrate).
    Standalone {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/strata")]
        data_dir: PathBuf,

        /// Scheduler tick interval in seconds.
        #[arg(long, default_value = "10")]
        scheduler_interval: u64,

        /// Health sweep interval in seconds.
        #[arg(long, default_value = "15")]
        health_interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stratad=debug,strata=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            data_dir,
            scheduler_interval,
            health_interval,
        } => run_standalone(data_dir, scheduler_interval, health_interval).await,
    }
}

async fn run_standalone(
    data_dir: PathBuf,
    scheduler_interval: u64,
    health_interval: u64,
) -> anyhow::Result<()> {
    info!("Strata daemon starting in standalone mode");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("strata.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let registry = Arc::new(Registry::new(BreakerConfig::default()));

    // Standalone mode runs against the in-process substrate; a real
    // deployment swaps in a remote ExecutionSubstrate here.
    let substrate = Arc::new(FakeSubstrate::new());
    info!("fake substrate initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = Arc::new(Orchestrator::new(
        state.clone(),
        Arc::clone(&registry),
        substrate.clone(),
        Arc::new(StaticTemplateProvider::new()),
        substrate.clone(),
        OrchestratorConfig::default(),
        shutdown_rx.clone(),
    ));
    info!("orchestrator initialized");

    let scheduler = Scheduler::new(
        Arc::clone(&orchestrator),
        state.clone(),
        SchedulerConfig {
            tick_interval: Duration::from_secs(scheduler_interval),
            ..SchedulerConfig::default()
        },
    );
    info!(interval = scheduler_interval, "scheduler initialized");

    // ── Start background tasks ─────────────────────────────────

    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });

    let monitor = Arc::clone(&orchestrator);
    let monitor_shutdown = shutdown_rx.clone();
    let monitor_handle = tokio::spawn(async move {
        monitor
            .run_health_monitor(Duration::from_secs(health_interval), monitor_shutdown)
            .await;
    });

    info!("Strata daemon running, press Ctrl-C to stop");

    // Graceful shutdown on Ctrl-C.
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_handle.await;
    let _ = monitor_handle.await;

    info!("Strata daemon stopped");
    Ok(())
}
