//! Event intake handler

use axum::{extract::State, http::StatusCode, Json};

use crate::error::AppResult;
use crate::pipeline::{IngestReport, ProcessedEvent};
use crate::AppState;

/// Accept one raw sensor report and run it through the pipeline. The
/// response carries the stored threat and its linked action after the
/// pipeline reached a stable state.
pub async fn ingest(
    State(state): State<AppState>,
    Json(report): Json<IngestReport>,
) -> AppResult<(StatusCode, Json<ProcessedEvent>)> {
    let processed = state.pipeline.process(report).await?;
    Ok((StatusCode::CREATED, Json(processed)))
}
