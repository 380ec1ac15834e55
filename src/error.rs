//! Error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

pub type AppResult<T> = Result<T, PipelineError>;

/// Errors surfaced at the service boundary.
///
/// Collaborator failures never appear here: scoring faults downgrade to the
/// deterministic fallback and execution faults end up in the action's
/// `Failed` status. Only malformed input and transition violations are hard
/// rejections.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("action is not awaiting confirmation")]
    NotAwaitingConfirmation,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            PipelineError::MalformedEvent(msg) => {
                (StatusCode::BAD_REQUEST, format!("malformed event: {}", msg))
            }
            PipelineError::NotFound(entity) => {
                (StatusCode::NOT_FOUND, format!("{} not found", entity))
            }
            PipelineError::NotAwaitingConfirmation => (
                StatusCode::CONFLICT,
                "action is not awaiting confirmation".to_string(),
            ),
            PipelineError::Store(StoreError::NotFound { entity, .. }) => {
                (StatusCode::NOT_FOUND, format!("{} not found", entity))
            }
            PipelineError::Store(err @ StoreError::InvalidTransition { .. }) => {
                // Race or programming defect; the original state was preserved.
                tracing::warn!("rejected transition: {}", err);
                (StatusCode::CONFLICT, err.to_string())
            }
            PipelineError::Store(StoreError::Conflict(msg)) => {
                (StatusCode::CONFLICT, msg.clone())
            }
            PipelineError::Store(StoreError::Backend(msg)) => {
                tracing::error!("storage backend error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}
