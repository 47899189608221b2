//! Health and statistics endpoints

use axum::{extract::State, routing::get, Json, Router};
use confer_sfu::SfuStats;

use crate::http::{AppError, AppResult, AppState};

pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/api/stats", get(stats))
}

/// OK while new peers are accepted; 503 once the media engine died
pub async fn health_check(State(state): State<AppState>) -> AppResult<&'static str> {
    if state.protocol.is_accepting() {
        Ok("OK")
    } else {
        Err(AppError::service_unavailable("media engine is down"))
    }
}

pub async fn stats(State(state): State<AppState>) -> Json<SfuStats> {
    Json(state.protocol.stats())
}
