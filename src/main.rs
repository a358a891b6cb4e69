//! Heimdall - network reachability watcher.
//!
//! Probes a target on a fixed cadence, records every outage as a closed
//! downtime interval and serves status and uptime statistics over HTTP.

mod clock;
mod config;
mod db;
mod monitor;
mod probe;
mod query;
mod scheduler;
mod web;

use clock::{Clock, MonotonicClock, SystemClock};
use config::{ServerConfig, SettingsManager};
use db::Store;
use monitor::{SharedTracker, StateTracker};
use probe::NetworkProbe;
use query::QueryService;
use scheduler::{PollLoop, RetentionManager, StoreHealth};
use web::{AppState, Server};

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("heimdall=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Heimdall on {}:{}...", cfg.http_host, cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let settings = Arc::new(SettingsManager::load(&cfg));
    let tracker = SharedTracker::new(StateTracker::new());
    let health = Arc::new(StoreHealth::default());
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new(SystemClock));
    let probe = Arc::new(NetworkProbe::new()?);

    let (stop_tx, _) = broadcast::channel::<()>(1);

    // Start monitoring
    let poll = PollLoop::new(
        probe,
        tracker.clone(),
        store.clone(),
        clock.clone(),
        health.clone(),
        settings.subscribe(),
        cfg.degraded_after,
    );
    let poll_handle = tokio::spawn(poll.run(stop_tx.subscribe()));

    let retention_handle =
        RetentionManager::new(store.clone(), clock.clone(), cfg.sample_retention).start(stop_tx.subscribe());

    // Start web server
    let query = Arc::new(QueryService::new(tracker, store, clock, health, cfg.stats_window));
    let server = Server::new(cfg, AppState { query, settings });

    let shutdown_tx = stop_tx.clone();
    let result = server
        .start(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(());
        })
        .await;

    // The server may also have failed on its own; stop the background tasks
    // either way.
    let _ = stop_tx.send(());
    if let Err(e) = poll_handle.await {
        tracing::error!("Poll loop task failed: {}", e);
    }
    if let Err(e) = retention_handle.await {
        tracing::error!("Retention task failed: {}", e);
    }

    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
}
