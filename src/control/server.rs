//! Control API server

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::config::ControlConfig;
use crate::control::handlers;
use crate::session::StreamSession;

/// Shared handler state
pub struct AppState {
    pub session: Arc<StreamSession>,
    pub started_at: Instant,
    /// Port used when `POST /api/start` names a host without a port
    pub default_peer_port: u16,
}

/// HTTP control surface for a [`StreamSession`]
pub struct ControlServer {
    config: ControlConfig,
    state: Arc<AppState>,
}

impl ControlServer {
    pub fn new(config: ControlConfig, session: Arc<StreamSession>, default_peer_port: u16) -> Self {
        Self {
            config,
            state: Arc::new(AppState {
                session,
                started_at: Instant::now(),
                default_peer_port,
            }),
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/devices", get(handlers::get_devices))
            .route("/api/start", post(handlers::start_stream))
            .route("/api/stop", post(handlers::stop_stream))
            .route("/api/counters/reset", post(handlers::reset_counters))
            .route("/api/settings", put(handlers::update_settings))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Serve until the listener fails
    pub async fn run(self) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.http_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Control API listening on http://{}", addr);

        axum::serve(listener, self.router()).await
    }

    /// Spawn the server on the current runtime
    pub fn start_background(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Control API server error: {}", e);
            }
        })
    }
}
