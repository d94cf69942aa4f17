//! suo - schema upgrade orchestrator.
//!
//! Coordinates a fleet-wide schema auto-upgrade against a shared Postgres
//! store: exactly one instance claims the upgrade, plans the minor-version
//! path, drives the external migrator through it (pausing at out-of-band
//! migration interrupts), runs per-schema last-mile patches, and serves
//! progress and holding-page configuration over HTTP while it works.

mod config;
mod coordinator;
mod error;
mod executor;
mod metrics;
mod oob;
mod orchestrator;
mod plan;
mod runner;
mod server;
mod store;
mod version;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use config::Config;
use oob::MigratorRegistry;
use orchestrator::Orchestrator;
use runner::ExecRunner;
use store::postgres::PgStatusStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    // Initialize logging
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!("Starting suo v{}", VERSION);

    if let Err(e) = run().await {
        error!("Auto-upgrade failed: {}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing subscriber with JSON format for production.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .init();

    Ok(())
}

async fn run() -> Result<()> {
    let config = Config::load()?;

    let store = PgStatusStore::connect(&config.database_url, &config.app_name).await?;
    info!("Connected to status store as '{}'", config.app_name);

    // Out-of-band migrators land here as they are written, keyed by the
    // version whose schema they backfill.
    let registry = MigratorRegistry::new();

    let runner = ExecRunner::new(
        &config.migrator_bin,
        config.database_url.clone(),
        &config.app_name,
    );

    let shutdown = spawn_signal_listener();

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(store),
        Arc::new(registry),
        Arc::new(runner),
    );
    orchestrator.run(shutdown).await
}

/// Flip a watch channel on SIGINT or SIGTERM so sleeping loops can bail out
/// instead of being killed mid-step.
fn spawn_signal_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received interrupt, shutting down");
        }

        let _ = tx.send(true);
    });

    rx
}
