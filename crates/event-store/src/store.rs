use std::pin::Pin;
use std::time::Instant;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{AggregateId, EventEnvelope, EventQuery, EventStoreError, NewEvent, Result, Sequence};

/// Outcome of an append.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendResult {
    /// The committed event. For a deduplicated append this is the event that
    /// was committed by the earlier request carrying the same key.
    pub event: EventEnvelope,

    /// True when nothing new was written because of the idempotency key.
    pub deduplicated: bool,
}

/// A stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Core trait for event store implementations.
///
/// The store is the system of record: an append-only log keyed by
/// `(aggregate_id, sequence)`. Committed events are never reordered, updated
/// or dropped. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends one event, assigning the next sequence of its aggregate.
    ///
    /// Succeeds only once the event is durably committed and therefore
    /// visible to the change feed.
    async fn append(&self, event: NewEvent) -> Result<AppendResult>;

    /// Retrieves all events for a specific aggregate, in sequence order.
    async fn get_events_for_aggregate(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<EventEnvelope>>;

    /// Retrieves events matching a query.
    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>>;

    /// Streams all events in the store in commit order.
    async fn stream_all_events(&self) -> Result<EventStream>;

    /// Gets the latest committed sequence of an aggregate.
    ///
    /// Returns None if the aggregate has no events.
    async fn current_sequence(&self, aggregate_id: &AggregateId) -> Result<Option<Sequence>>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Appends an event built from its parts and returns the assigned sequence.
    async fn append_event(
        &self,
        aggregate_id: AggregateId,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Sequence> {
        let appended = self
            .append(NewEvent::new(aggregate_id, event_type, payload))
            .await?;
        Ok(appended.event.sequence)
    }

    /// Checks if an aggregate exists (has any events).
    async fn aggregate_exists(&self, aggregate_id: &AggregateId) -> Result<bool> {
        Ok(self.current_sequence(aggregate_id).await?.is_some())
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Records `event_store_append_duration_seconds` for one append when dropped,
/// whichever way the append returns.
pub(crate) struct AppendTimer {
    store: &'static str,
    started: Instant,
}

impl AppendTimer {
    pub(crate) fn start(store: &'static str) -> Self {
        Self {
            store,
            started: Instant::now(),
        }
    }
}

impl Drop for AppendTimer {
    fn drop(&mut self) {
        metrics::histogram!("event_store_append_duration_seconds", "store" => self.store)
            .record(self.started.elapsed().as_secs_f64());
    }
}

/// Validates an event before appending.
pub fn validate_new_event(event: &NewEvent) -> Result<()> {
    if event.aggregate_id.as_str().is_empty() {
        return Err(EventStoreError::InvalidEvent(
            "aggregate_id must not be empty".to_string(),
        ));
    }
    if event.event_type.is_empty() {
        return Err(EventStoreError::InvalidEvent(
            "event_type must not be empty".to_string(),
        ));
    }
    if let Some(key) = &event.idempotency_key
        && key.is_empty()
    {
        return Err(EventStoreError::InvalidEvent(
            "idempotency_key must not be empty when present".to_string(),
        ));
    }
    Ok(())
}
