//! Command submission endpoint.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use domain::DomainError;
use event_store::EventStore;
use serde::Serialize;

use super::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct CommandResponse {
    pub message: &'static str,
    pub aggregate_id: String,
    pub event_type: String,
    pub sequence: i64,
}

/// POST /command: validate a command and append its event.
///
/// The body is read raw so that malformed JSON is reported with the same
/// error shape as every other validation failure.
#[tracing::instrument(skip(state, body), fields(bytes = body.len()))]
pub async fn submit<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> Result<Json<CommandResponse>, ApiError> {
    let ack = state.ingestor.ingest_body(&body).await.inspect_err(|e| {
        if matches!(e, DomainError::Validation(_)) {
            metrics::counter!("commands_rejected_total").increment(1);
        }
    })?;

    Ok(Json(CommandResponse {
        message: ack.message(),
        aggregate_id: ack.aggregate_id.to_string(),
        event_type: ack.event_type,
        sequence: ack.sequence.as_i64(),
    }))
}
