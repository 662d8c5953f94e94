//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::history::HistorySnapshotter;
use crate::metrics::MetricsRegistry;
use crate::reliability::ReliabilityAggregator;
use crate::state::StateStore;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub state: Arc<StateStore>,
    pub history: Arc<HistorySnapshotter>,
    pub reliability: Arc<ReliabilityAggregator>,
    pub metrics: Arc<MetricsRegistry>,
}

/// Read-only HTTP surface over the monitor's state.
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/", get(handlers::handle_state))
            .route("/history", get(handlers::handle_history))
            .route("/reliability", get(handlers::handle_reliability))
            .route("/metrics/prometheus", get(handlers::handle_prometheus))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
