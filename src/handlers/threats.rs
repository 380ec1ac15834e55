//! Threats handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use uuid::Uuid;

use crate::error::{AppResult, PipelineError};
use crate::models::{ThreatEvent, ThreatFilter};
use crate::AppState;

/// List threats, newest first
pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<ThreatFilter>,
) -> AppResult<Json<Vec<ThreatEvent>>> {
    let threats = state.store.list_threats(&filter).await?;
    Ok(Json(threats))
}

/// Get single threat
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ThreatEvent>> {
    let threat = state
        .store
        .get_threat(id)
        .await?
        .ok_or(PipelineError::NotFound("threat"))?;
    Ok(Json(threat))
}
