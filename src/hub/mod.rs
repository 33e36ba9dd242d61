//! Relay hub
//!
//! The server side of the session channel. Each device connects to
//! `/ws/{session_id}?deviceId=...`; the hub keeps per-session presence and a
//! capped replay history, relays events between the devices of a session,
//! and forgets sessions that have been idle for a day.
//!
//! HTTP:
//! - `GET /health`
//! - `GET /sessions/{id}/messages` (consumed by the polling path)
//! - `GET /sessions/{id}/devices`

mod routes;
mod state;
mod websocket;

use std::sync::Arc;

use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;

pub use routes::{DevicesResponse, HealthResponse, MessagesResponse};
pub use state::{
    DEFAULT_CLEANUP_INTERVAL, DEFAULT_HISTORY_CAP, DEFAULT_IDLE_TTL, HubSettings, HubState, PeerId,
};

/// Build the hub router over shared state
pub fn router(state: Arc<HubState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/{session_id}", get(websocket::ws_upgrade))
        .route("/sessions/{session_id}/messages", get(routes::session_messages))
        .route("/sessions/{session_id}/devices", get(routes::session_devices))
        .route("/health", get(routes::health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically drop idle sessions
#[must_use]
pub fn spawn_cleanup(state: Arc<HubState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.settings().cleanup_interval);
        // First tick fires immediately; nothing can be idle yet
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = state.cleanup_idle().await;
            if removed > 0 {
                tracing::info!(removed, "removed inactive sessions");
            }
        }
    })
}

/// The relay hub server
#[derive(Debug)]
pub struct HubServer {
    state: Arc<HubState>,
    port: u16,
}

impl HubServer {
    #[must_use]
    pub fn new(settings: HubSettings, port: u16) -> Self {
        Self {
            state: Arc::new(HubState::new(settings)),
            port,
        }
    }

    #[must_use]
    pub fn state(&self) -> Arc<HubState> {
        Arc::clone(&self.state)
    }

    /// Bind `0.0.0.0:{port}` and serve until the process ends
    ///
    /// # Errors
    ///
    /// Returns error if the server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind hub: {e}")))?;

        tracing::info!(port = self.port, "hub listening");
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let cleanup = spawn_cleanup(Arc::clone(&self.state));

        let result = axum::serve(listener, router(self.state))
            .await
            .map_err(|e| crate::Error::Transport(format!("hub server error: {e}")));

        cleanup.abort();
        result
    }

    /// Run the hub in a background task
    #[must_use]
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
