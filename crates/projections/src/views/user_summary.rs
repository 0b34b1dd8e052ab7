//! Summary view: one `{user_id, name}` record per user.

use async_trait::async_trait;
use common::AggregateId;
use domain::UserEvent;
use event_store::EventEnvelope;

use crate::Result;
use crate::projection::{ApplyOutcome, Projection};
use crate::read_model::{SummaryStore, UserSummary, WriteOutcome};

/// Maintains [`UserSummary`] records from `USER_CREATED` events.
#[derive(Clone)]
pub struct UserSummaryProjection<S: SummaryStore> {
    store: S,
}

impl<S: SummaryStore> UserSummaryProjection<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: SummaryStore> Projection for UserSummaryProjection<S> {
    fn name(&self) -> &'static str {
        "UserSummary"
    }

    async fn apply(&self, envelope: &EventEnvelope, event: &UserEvent) -> Result<ApplyOutcome> {
        let UserEvent::Created(data) = event else {
            return Ok(ApplyOutcome::Ignored);
        };

        let summary = UserSummary {
            user_id: envelope.aggregate_id.clone(),
            name: data.name_or_default().to_string(),
            last_applied_sequence: envelope.sequence,
        };

        match self.store.put_summary_if_newer(summary).await? {
            WriteOutcome::Written => Ok(ApplyOutcome::Applied),
            WriteOutcome::Stale | WriteOutcome::Missing => Ok(ApplyOutcome::Duplicate),
        }
    }

    async fn reset(&self) -> Result<()> {
        self.store.clear_summaries().await
    }

    async fn reset_aggregate(&self, aggregate_id: &AggregateId) -> Result<()> {
        self.store.remove_summary(aggregate_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AggregateId;
    use domain::{DEFAULT_NAME, USER_BALANCE, USER_CREATED};
    use event_store::Sequence;

    use crate::read_model::InMemoryReadModels;

    fn envelope(id: &str, seq: i64, event_type: &str, payload: serde_json::Value) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(id)
            .sequence(Sequence::new(seq))
            .event_type(event_type)
            .payload(payload)
            .build()
    }

    async fn apply(
        projection: &UserSummaryProjection<InMemoryReadModels>,
        envelope: &EventEnvelope,
    ) -> ApplyOutcome {
        let event = UserEvent::decode(&envelope.event_type, &envelope.payload).unwrap();
        projection.apply(envelope, &event).await.unwrap()
    }

    #[tokio::test]
    async fn created_writes_summary() {
        let projection = UserSummaryProjection::new(InMemoryReadModels::new());
        let created = envelope("user-001", 1, USER_CREATED, serde_json::json!({"name": "Alice"}));

        assert_eq!(apply(&projection, &created).await, ApplyOutcome::Applied);

        let summary = projection
            .store()
            .get_summary(&AggregateId::new("user-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.name, "Alice");
        assert_eq!(summary.last_applied_sequence, Sequence::first());
    }

    #[tokio::test]
    async fn created_without_name_uses_default() {
        let projection = UserSummaryProjection::new(InMemoryReadModels::new());
        apply(&projection, &envelope("user-001", 1, USER_CREATED, serde_json::json!({}))).await;

        let summary = projection
            .store()
            .get_summary(&AggregateId::new("user-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.name, DEFAULT_NAME);
    }

    #[tokio::test]
    async fn redelivered_created_is_duplicate() {
        let projection = UserSummaryProjection::new(InMemoryReadModels::new());
        let created = envelope("user-001", 1, USER_CREATED, serde_json::json!({"name": "Alice"}));

        apply(&projection, &created).await;
        assert_eq!(apply(&projection, &created).await, ApplyOutcome::Duplicate);
        assert_eq!(projection.store().summary_count().await, 1);
    }

    #[tokio::test]
    async fn balance_events_are_ignored() {
        let projection = UserSummaryProjection::new(InMemoryReadModels::new());
        let balance = envelope("user-001", 2, USER_BALANCE, serde_json::json!({"delta": 5}));

        assert_eq!(apply(&projection, &balance).await, ApplyOutcome::Ignored);
        assert_eq!(projection.store().summary_count().await, 0);
    }
}
