//! Detail view: name, email and running balance per user.

use async_trait::async_trait;
use common::AggregateId;
use domain::UserEvent;
use event_store::EventEnvelope;

use crate::projection::{ApplyOutcome, Projection};
use crate::read_model::{DetailStore, UserDetail, WriteOutcome};
use crate::{ProjectionError, Result};

/// Maintains [`UserDetail`] records.
///
/// `USER_CREATED` replaces the record with a zero balance; `USER_BALANCE`
/// adds its delta. Both are guarded by the record's last applied sequence,
/// so a redelivered balance change is never counted twice.
#[derive(Clone)]
pub struct UserDetailProjection<S: DetailStore> {
    store: S,
}

impl<S: DetailStore> UserDetailProjection<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: DetailStore> Projection for UserDetailProjection<S> {
    fn name(&self) -> &'static str {
        "UserDetail"
    }

    async fn apply(&self, envelope: &EventEnvelope, event: &UserEvent) -> Result<ApplyOutcome> {
        let outcome = match event {
            UserEvent::Created(data) => {
                let detail = UserDetail {
                    user_id: envelope.aggregate_id.clone(),
                    name: data.name_or_default().to_string(),
                    email: data.email_or_default().to_string(),
                    balance: 0,
                    last_applied_sequence: envelope.sequence,
                };
                self.store.put_detail_if_newer(detail).await?
            }
            UserEvent::BalanceAdjusted(data) => {
                self.store
                    .adjust_balance(&envelope.aggregate_id, data.delta, envelope.sequence)
                    .await?
            }
            UserEvent::Unknown { .. } => return Ok(ApplyOutcome::Ignored),
        };

        match outcome {
            WriteOutcome::Written => Ok(ApplyOutcome::Applied),
            WriteOutcome::Stale => Ok(ApplyOutcome::Duplicate),
            WriteOutcome::Missing => Err(ProjectionError::MissingRecord {
                aggregate_id: envelope.aggregate_id.clone(),
            }),
        }
    }

    async fn reset(&self) -> Result<()> {
        self.store.clear_details().await
    }

    async fn reset_aggregate(&self, aggregate_id: &AggregateId) -> Result<()> {
        self.store.remove_detail(aggregate_id).await
    }
}
