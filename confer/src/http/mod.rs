//! HTTP surface: the signaling WebSocket plus health and stats endpoints

mod error;
pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use confer_sfu::SessionProtocol;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub protocol: Arc<SessionProtocol>,
    /// Largest accepted WebSocket frame, in bytes
    pub max_message_size: usize,
}

impl AppState {
    #[must_use]
    pub const fn new(protocol: Arc<SessionProtocol>, max_message_size: usize) -> Self {
        Self {
            protocol,
            max_message_size,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .merge(health::create_health_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
