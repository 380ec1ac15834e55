//! Health check handler

use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    store_backend: &'static str,
    stream_subscribers: usize,
    timestamp: i64,
}

pub async fn check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        store_backend: state.store.backend_name(),
        stream_subscribers: state.broadcaster.subscriber_count(),
        timestamp: chrono::Utc::now().timestamp(),
    })
}
