//! Debug endpoint exposing an aggregate's committed events.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use common::AggregateId;
use event_store::{EventEnvelope, EventStore};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct EventsParams {
    pub user_id: Option<String>,
}

#[derive(Serialize)]
pub struct EventResponse {
    pub event_id: String,
    pub sequence: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: String,
}

impl From<EventEnvelope> for EventResponse {
    fn from(event: EventEnvelope) -> Self {
        Self {
            event_id: event.event_id.to_string(),
            sequence: event.sequence.as_i64(),
            event_type: event.event_type,
            payload: event.payload,
            timestamp: event.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub aggregate_id: String,
    pub events: Vec<EventResponse>,
}

/// GET /events?user_id=: the committed event history of one aggregate.
#[tracing::instrument(skip(state, params), fields(user_id = ?params.user_id))]
pub async fn list<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(params): Query<EventsParams>,
) -> Result<Json<EventsResponse>, ApiError> {
    let user_id = params
        .user_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing user_id".to_string()))?;
    let aggregate_id = AggregateId::new(user_id);

    let events = state
        .event_store
        .get_events_for_aggregate(&aggregate_id)
        .await?;

    Ok(Json(EventsResponse {
        aggregate_id: aggregate_id.into_inner(),
        events: events.into_iter().map(EventResponse::from).collect(),
    }))
}
