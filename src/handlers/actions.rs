//! Actions handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppResult, PipelineError};
use crate::models::{ActionFilter, RemediationAction};
use crate::pipeline::ConfirmDecision;
use crate::AppState;

/// List actions, newest first
pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<ActionFilter>,
) -> AppResult<Json<Vec<RemediationAction>>> {
    let actions = state.store.list_actions(&filter).await?;
    Ok(Json(actions))
}

/// Get single action
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<RemediationAction>> {
    let action = state
        .store
        .get_action(id)
        .await?
        .ok_or(PipelineError::NotFound("action"))?;
    Ok(Json(action))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub decision: ConfirmDecision,
}

/// Apply an operator decision to an action awaiting confirmation
pub async fn confirm(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ConfirmRequest>,
) -> AppResult<Json<RemediationAction>> {
    let action = state.pipeline.confirm(id, req.decision).await?;
    Ok(Json(action))
}
