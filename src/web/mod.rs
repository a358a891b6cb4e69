//! Web server module.

mod handlers;

use crate::config::{ServerConfig, SettingsManager};
use crate::query::QueryService;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub query: Arc<QueryService>,
    pub settings: Arc<SettingsManager>,
}

/// Build the router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/status", get(handlers::handle_status))
        .route("/api/stats", get(handlers::handle_stats))
        .route("/api/downtimes", get(handlers::handle_downtimes))
        .route(
            "/api/config",
            get(handlers::handle_get_config).post(handlers::handle_update_config),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}

/// JSON API server for Heimdall.
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve until `shutdown` resolves.
    pub async fn start(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener =
            tokio::net::TcpListener::bind((self.config.http_host.as_str(), self.config.http_port)).await?;
        tracing::info!("Web server listening on {}", listener.local_addr()?);

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
