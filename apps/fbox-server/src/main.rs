//! # F-BOX Server
//!
//! Runs the rental engine next to the dispensers' MQTT broker.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           fbox-server                                   │
//! │                                                                         │
//! │  dispensers ◄──► MQTT broker ◄──► Transport ──mpsc──► DispatchWorker    │
//! │                                      ▲                   │              │
//! │                                      │ publish           │ resolve      │
//! │                               DispenseCorrelator ◄───────┘              │
//! │                                      ▲                                  │
//! │                               RentalService ───► Database (SQLite)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `fbox-server [config.toml]`. Without an argument the platform
//! config directory is used; `FBOX_*` environment variables override it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fbox_db::{Database, DbConfig};
use fbox_link::{
    DispatchTable, DispatchWorker, DispenseCorrelator, FboxConfig, Transport, TransportConfig,
};
use fbox_rental::{RentalConfig, RentalService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    info!("Starting F-BOX server...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = FboxConfig::load_or_default(config_path);
    info!(
        broker = %config.broker.url,
        client_id = %config.broker.client_id,
        database = %config.database.path.display(),
        "Configuration loaded"
    );

    // Database
    if let Some(parent) = config.database.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Database::new(
        DbConfig::new(&config.database.path).max_connections(config.database.max_connections),
    )
    .await
    .context("opening ledger database")?;

    // Device link
    let transport_config =
        TransportConfig::from_settings(&config.broker).context("broker settings")?;
    let (transport, status_rx) = Transport::spawn(transport_config);
    let correlator = Arc::new(DispenseCorrelator::new(Arc::new(transport.clone())));

    let table = DispatchTable::with_default_handlers(
        db.clone(),
        correlator.clone(),
        config.rental.stock_low_threshold,
    );
    let worker = DispatchWorker::spawn(table, status_rx);

    // Orchestrator
    let rentals = RentalService::new(
        db.clone(),
        correlator.clone(),
        RentalConfig::from(&config.rental),
    );

    match rentals.inventory_status().await {
        Ok(inventory) => {
            for group in &inventory {
                let online = group.items.iter().filter(|i| i.online).count();
                info!(
                    category = %group.category,
                    products = group.items.len(),
                    online,
                    "Inventory"
                );
            }
        }
        Err(e) => warn!(error = %e, "Could not read inventory at startup"),
    }

    info!("F-BOX server ready");
    shutdown_signal().await;

    // Waiters resolve as transport_unavailable before the link goes away.
    correlator.cancel_all();
    if let Err(e) = transport.shutdown().await {
        warn!(error = %e, "Transport shutdown signal failed");
    }
    drop(rentals);
    drop(correlator);

    // The worker ends once the transport task drops its sender.
    if let Err(e) = worker.await {
        warn!(error = %e, "Dispatch worker ended abnormally");
    }
    db.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
