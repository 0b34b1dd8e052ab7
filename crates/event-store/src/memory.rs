use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    AggregateId, ChangeBatch, ChangeFeed, ChangeRecord, EventEnvelope, EventQuery, FeedPosition,
    NewEvent, Result, Sequence,
    store::{AppendResult, AppendTimer, EventStore, EventStream, validate_new_event},
};

#[derive(Default)]
struct Log {
    /// Every committed event in commit order; position = index + 1.
    events: Vec<EventEnvelope>,
    /// Latest sequence per aggregate.
    heads: HashMap<AggregateId, Sequence>,
    /// (aggregate, idempotency key) -> index into `events`.
    keys: HashMap<(AggregateId, String), usize>,
}

/// In-memory event store implementation for testing and single-process runs.
///
/// Provides the same interface as the PostgreSQL implementation, including
/// the change feed. Cloning yields another handle to the same log.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.events.len()
    }

    /// Clears all events.
    pub async fn clear(&self) {
        let mut log = self.log.write().await;
        log.events.clear();
        log.heads.clear();
        log.keys.clear();
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[tracing::instrument(skip(self, event), fields(aggregate_id = %event.aggregate_id, event_type = %event.event_type))]
    async fn append(&self, event: NewEvent) -> Result<AppendResult> {
        let _timer = AppendTimer::start("memory");
        validate_new_event(&event)?;

        // The write lock makes sequence assignment atomic per store.
        let mut log = self.log.write().await;

        if let Some(key) = &event.idempotency_key
            && let Some(&index) = log.keys.get(&(event.aggregate_id.clone(), key.clone()))
        {
            return Ok(AppendResult {
                event: log.events[index].clone(),
                deduplicated: true,
            });
        }

        let sequence = log
            .heads
            .get(&event.aggregate_id)
            .copied()
            .unwrap_or(Sequence::initial())
            .next();
        let envelope = EventEnvelope::commit(event, sequence);

        let index = log.events.len();
        log.heads.insert(envelope.aggregate_id.clone(), sequence);
        if let Some(key) = &envelope.idempotency_key {
            log.keys
                .insert((envelope.aggregate_id.clone(), key.clone()), index);
        }
        log.events.push(envelope.clone());

        Ok(AppendResult {
            event: envelope,
            deduplicated: false,
        })
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        let mut events: Vec<_> = log
            .events
            .iter()
            .filter(|e| &e.aggregate_id == aggregate_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        let events = log
            .events
            .iter()
            .filter(|e| query.matches(e))
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(events)
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        use futures_util::stream;

        let events = self.log.read().await.events.clone();
        let stream = stream::iter(events.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }

    async fn current_sequence(&self, aggregate_id: &AggregateId) -> Result<Option<Sequence>> {
        Ok(self.log.read().await.heads.get(aggregate_id).copied())
    }
}

#[async_trait]
impl ChangeFeed for InMemoryEventStore {
    async fn poll(&self, after: FeedPosition, limit: usize) -> Result<ChangeBatch> {
        let log = self.log.read().await;
        let start = usize::try_from(after.as_i64()).unwrap_or(0);

        let records = log
            .events
            .iter()
            .enumerate()
            .skip(start)
            .take(limit)
            .map(|(index, event)| {
                ChangeRecord::insert(event, FeedPosition::new(index as i64 + 1))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ChangeBatch::new(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeKind, EventStoreError, EventStoreExt};

    fn new_event(aggregate_id: &str, event_type: &str) -> NewEvent {
        NewEvent::new(aggregate_id, event_type, serde_json::json!({"test": true}))
    }

    #[test]
    fn append_records_latency_histogram() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let store = InMemoryEventStore::new();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                store.append(new_event("user-001", "USER_CREATED")).await.unwrap();
                store.append(new_event("", "USER_CREATED")).await.unwrap_err();
            })
        });

        let rendered = handle.render();
        assert!(rendered.contains("event_store_append_duration_seconds"));
        assert!(rendered.contains(r#"store="memory""#));
    }

    #[tokio::test]
    async fn append_assigns_sequences_per_aggregate() {
        let store = InMemoryEventStore::new();

        let a1 = store.append(new_event("user-a", "E1")).await.unwrap();
        let b1 = store.append(new_event("user-b", "E1")).await.unwrap();
        let a2 = store.append(new_event("user-a", "E2")).await.unwrap();

        assert_eq!(a1.event.sequence, Sequence::new(1));
        assert_eq!(b1.event.sequence, Sequence::new(1));
        assert_eq!(a2.event.sequence, Sequence::new(2));
        assert!(!a2.deduplicated);
        assert_eq!(store.event_count().await, 3);
    }

    #[tokio::test]
    async fn append_event_returns_sequence() {
        let store = InMemoryEventStore::new();

        let seq = store
            .append_event(AggregateId::new("user-001"), "USER_CREATED", serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(seq, Sequence::first());
        assert!(store.aggregate_exists(&AggregateId::new("user-001")).await.unwrap());
    }

    #[tokio::test]
    async fn idempotency_key_deduplicates() {
        let store = InMemoryEventStore::new();

        let first = store
            .append(new_event("user-001", "USER_BALANCE").with_idempotency_key("req-1"))
            .await
            .unwrap();
        let again = store
            .append(new_event("user-001", "USER_BALANCE").with_idempotency_key("req-1"))
            .await
            .unwrap();

        assert!(again.deduplicated);
        assert_eq!(again.event.event_id, first.event.event_id);
        assert_eq!(store.event_count().await, 1);

        // Same key on another aggregate is a different command.
        let other = store
            .append(new_event("user-002", "USER_BALANCE").with_idempotency_key("req-1"))
            .await
            .unwrap();
        assert!(!other.deduplicated);
    }

    #[tokio::test]
    async fn invalid_event_is_rejected() {
        let store = InMemoryEventStore::new();
        let result = store.append(new_event("", "USER_CREATED")).await;
        assert!(matches!(result, Err(EventStoreError::InvalidEvent(_))));
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn get_events_for_aggregate_in_sequence_order() {
        let store = InMemoryEventStore::new();
        for event_type in ["E1", "E2", "E3"] {
            store.append(new_event("user-001", event_type)).await.unwrap();
        }
        store.append(new_event("user-002", "E1")).await.unwrap();

        let events = store
            .get_events_for_aggregate(&AggregateId::new("user-001"))
            .await
            .unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, ["E1", "E2", "E3"]);
        assert_eq!(events[2].sequence, Sequence::new(3));
    }

    #[tokio::test]
    async fn query_events_with_filters() {
        let store = InMemoryEventStore::new();
        for event_type in ["USER_CREATED", "USER_BALANCE", "USER_BALANCE"] {
            store.append(new_event("user-001", event_type)).await.unwrap();
        }

        let query = EventQuery::for_aggregate("user-001")
            .event_type("USER_BALANCE")
            .limit(1);
        let results = store.query_events(query).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sequence, Sequence::new(2));
    }

    #[tokio::test]
    async fn stream_all_events_in_commit_order() {
        use futures_util::StreamExt;

        let store = InMemoryEventStore::new();
        store.append(new_event("user-b", "E1")).await.unwrap();
        store.append(new_event("user-a", "E1")).await.unwrap();

        let events: Vec<_> = store.stream_all_events().await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().aggregate_id.as_str(), "user-b");
    }

    #[tokio::test]
    async fn current_sequence_tracks_head() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("user-001");

        assert!(store.current_sequence(&id).await.unwrap().is_none());

        store.append(new_event("user-001", "E1")).await.unwrap();
        store.append(new_event("user-001", "E2")).await.unwrap();

        assert_eq!(
            store.current_sequence(&id).await.unwrap(),
            Some(Sequence::new(2))
        );
    }

    #[tokio::test]
    async fn feed_pages_by_position_and_redelivers() {
        let store = InMemoryEventStore::new();
        for i in 0..5 {
            store
                .append(new_event(&format!("user-{i}"), "USER_CREATED"))
                .await
                .unwrap();
        }

        let first = store.poll(FeedPosition::start(), 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.records[0].event_name, ChangeKind::Insert);
        assert_eq!(first.last_position(), Some(FeedPosition::new(2)));

        // Polling the same position again yields the same records.
        let again = store.poll(FeedPosition::start(), 2).await.unwrap();
        assert_eq!(again, first);

        let rest = store.poll(FeedPosition::new(2), 10).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest.last_position(), Some(FeedPosition::new(5)));

        let empty = store.poll(FeedPosition::new(5), 10).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn clear_resets_sequences() {
        let store = InMemoryEventStore::new();
        store.append(new_event("user-001", "E1")).await.unwrap();
        store.clear().await;

        let appended = store.append(new_event("user-001", "E1")).await.unwrap();
        assert_eq!(appended.event.sequence, Sequence::first());
    }
}
