//! Projection trigger endpoint.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use event_store::EventStore;
use projections::BatchReport;
use serde::Deserialize;

use super::AppState;
use crate::error::ApiError;

/// A batch of store-change records as pushed by an external feed.
///
/// Records stay untyped here so that one unreadable record is dead-lettered
/// on its own instead of rejecting the whole batch.
#[derive(Deserialize)]
pub struct ProjectionRequest {
    #[serde(rename = "Records", default)]
    pub records: Vec<serde_json::Value>,
}

/// POST /projection: apply a batch of change records to the read models.
#[tracing::instrument(skip(state, body))]
pub async fn trigger<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> Result<Json<BatchReport>, ApiError> {
    let request: ProjectionRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON in request body: {e}")))?;

    let report = state
        .projection_processor
        .process_raw_records(request.records)
        .await;

    Ok(Json(report))
}
