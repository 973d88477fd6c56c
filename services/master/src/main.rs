//! Corral master
//!
//! Runs a single master that leads immediately, optionally with a number of
//! in-process slaves for development.
//!
//! ## Architecture
//!
//! - **Master supervisor**: master, allocator and frameworks store actors
//! - **Whitelist loop**: reloads the host whitelist and pushes changes
//! - **Local slaves**: simulated slaves registered with the master

use std::sync::Arc;

use anyhow::{Context, Result};
use corral_master::actors::MasterSupervisor;
use corral_master::config::Config;
use corral_master::detector::MasterDetector;
use corral_master::storage::{FrameworksStorage, MemoryStorage, SqliteStorage};
use corral_master::whitelist::{load_whitelist, run_whitelist_loop};
use corral_protocol::SlaveInfo;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        host = %config.host,
        port = config.port,
        allocation_interval_ms = config.allocation_interval.as_millis() as u64,
        local_slaves = config.local_slaves,
        "Starting corral master"
    );

    let storage: Arc<dyn FrameworksStorage> = match &config.frameworks_db {
        Some(path) => Arc::new(
            SqliteStorage::open(path)
                .with_context(|| format!("opening frameworks database {}", path.display()))?,
        ),
        None => Arc::new(MemoryStorage::new()),
    };

    let whitelist = match &config.whitelist {
        Some(path) => Some(load_whitelist(path).await.context("loading whitelist")?),
        None => None,
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let detector = MasterDetector::new();
    let mut supervisor = MasterSupervisor::new(config.clone(), detector, shutdown_rx.clone());
    let master = supervisor.start(storage, whitelist.clone());
    supervisor.elect();

    let whitelist_handle = match (&config.whitelist, whitelist, supervisor.allocator()) {
        (Some(path), Some(hosts), Some(allocator)) => Some(tokio::spawn(run_whitelist_loop(
            path.clone(),
            config.whitelist_refresh,
            allocator.clone(),
            hosts,
            shutdown_rx.clone(),
        ))),
        _ => None,
    };

    for n in 0..config.local_slaves {
        let info = SlaveInfo {
            hostname: format!("local-{n}"),
            resources: config.local_slave_resources.clone(),
        };
        supervisor.spawn_local_slave(info, config.health_check_interval());
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    match master.state().await {
        Ok(state) => match serde_json::to_string(&state.stats) {
            Ok(stats) => info!(stats = %stats, "Final master stats"),
            Err(e) => error!(error = %e, "Failed to encode master stats"),
        },
        Err(e) => error!(error = %e, "Master did not report its state"),
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);
    supervisor.stop().await;
    if let Some(handle) = whitelist_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Whitelist loop panicked");
        }
    }

    info!("Master shutdown complete");
    Ok(())
}
