//! Core projection trait.

use async_trait::async_trait;
use common::AggregateId;
use domain::UserEvent;
use event_store::EventEnvelope;
use serde::Serialize;

use crate::Result;

/// What applying one event did to a projection's read model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The read model changed.
    Applied,
    /// The read model already reflected this event.
    Duplicate,
    /// The projection does not handle this event type.
    Ignored,
}

impl ApplyOutcome {
    /// Combines the outcomes of several projections for the same event.
    pub fn merge(self, other: ApplyOutcome) -> ApplyOutcome {
        use ApplyOutcome::*;
        match (self, other) {
            (Applied, _) | (_, Applied) => Applied,
            (Duplicate, _) | (_, Duplicate) => Duplicate,
            (Ignored, Ignored) => Ignored,
        }
    }
}

/// A projection folds committed events into a read model.
///
/// `apply` must be idempotent: applying an event whose sequence the read
/// model has already seen returns [`ApplyOutcome::Duplicate`] and changes
/// nothing.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Returns the name of this projection.
    fn name(&self) -> &'static str;

    /// Applies one decoded event.
    async fn apply(&self, envelope: &EventEnvelope, event: &UserEvent) -> Result<ApplyOutcome>;

    /// Resets the projection to its initial state.
    async fn reset(&self) -> Result<()>;

    /// Drops whatever the projection holds for one aggregate.
    async fn reset_aggregate(&self, aggregate_id: &AggregateId) -> Result<()>;
}
