//! Read-only view of the projection dead-letter queue.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use event_store::EventStore;
use projections::{DeadLetter, DeadLetterQueue};
use serde::Serialize;

use super::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct DeadLettersResponse {
    pub count: usize,
    pub dead_letters: Vec<DeadLetter>,
}

/// GET /dead-letters: records the projection engine could not apply.
pub async fn list<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<DeadLettersResponse>, ApiError> {
    let dead_letters = state
        .projection_processor
        .dead_letters()
        .list()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(DeadLettersResponse {
        count: dead_letters.len(),
        dead_letters,
    }))
}
