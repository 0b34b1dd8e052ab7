//! Read model records and the stores that hold them.
//!
//! Every write is conditional on the record's `last_applied_sequence`: a
//! write carrying a sequence that is not strictly newer than the stored one
//! is refused with [`WriteOutcome::Stale`]. This is what keeps projections
//! idempotent under at-least-once delivery without any locking on the
//! projection side.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use common::AggregateId;
use event_store::Sequence;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{ProjectionError, Result};

/// Lightweight per-user view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: AggregateId,
    pub name: String,
    pub last_applied_sequence: Sequence,
}

/// Full per-user view including the running balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDetail {
    pub user_id: AggregateId,
    pub name: String,
    pub email: String,
    pub balance: i64,
    pub last_applied_sequence: Sequence,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied and the stored sequence advanced.
    Written,
    /// The stored record already reflects this sequence or a later one.
    Stale,
    /// There is no record to update.
    Missing,
}

/// One page request of a summary scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Exclusive lower bound; `None` starts at the first key.
    pub start_after: Option<AggregateId>,
    pub limit: usize,
}

impl ScanRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            start_after: None,
            limit,
        }
    }

    pub fn after(key: AggregateId, limit: usize) -> Self {
        Self {
            start_after: Some(key),
            limit,
        }
    }
}

/// One page of a scan. `last_key` is set when more items may follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub last_key: Option<AggregateId>,
}

/// Storage for [`UserSummary`] records.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Inserts or replaces the summary if its sequence is newer than the stored one.
    async fn put_summary_if_newer(&self, summary: UserSummary) -> Result<WriteOutcome>;

    async fn get_summary(&self, user_id: &AggregateId) -> Result<Option<UserSummary>>;

    /// Returns at most `request.limit` summaries in key order.
    async fn scan_summaries(&self, request: ScanRequest) -> Result<Page<UserSummary>>;

    async fn remove_summary(&self, user_id: &AggregateId) -> Result<()>;

    async fn clear_summaries(&self) -> Result<()>;
}

/// Storage for [`UserDetail`] records.
#[async_trait]
pub trait DetailStore: Send + Sync {
    /// Inserts or replaces the detail if its sequence is newer than the stored one.
    async fn put_detail_if_newer(&self, detail: UserDetail) -> Result<WriteOutcome>;

    /// Adds `delta` to the balance if `sequence` is newer than the stored one.
    async fn adjust_balance(
        &self,
        user_id: &AggregateId,
        delta: i64,
        sequence: Sequence,
    ) -> Result<WriteOutcome>;

    async fn get_detail(&self, user_id: &AggregateId) -> Result<Option<UserDetail>>;

    async fn remove_detail(&self, user_id: &AggregateId) -> Result<()>;

    async fn clear_details(&self) -> Result<()>;
}

/// In-memory summary and detail stores over ordered maps.
///
/// Cloning yields another handle to the same maps. Each conditional write
/// holds the map's write lock for the compare and the update, which gives
/// the same guarantee as a conditional put against a database.
#[derive(Clone, Default)]
pub struct InMemoryReadModels {
    summaries: Arc<RwLock<BTreeMap<AggregateId, UserSummary>>>,
    details: Arc<RwLock<BTreeMap<AggregateId, UserDetail>>>,
}

impl InMemoryReadModels {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn summary_count(&self) -> usize {
        self.summaries.read().await.len()
    }

    pub async fn detail_count(&self) -> usize {
        self.details.read().await.len()
    }
}

#[async_trait]
impl SummaryStore for InMemoryReadModels {
    async fn put_summary_if_newer(&self, summary: UserSummary) -> Result<WriteOutcome> {
        let mut summaries = self.summaries.write().await;
        if let Some(existing) = summaries.get(&summary.user_id)
            && existing.last_applied_sequence >= summary.last_applied_sequence
        {
            return Ok(WriteOutcome::Stale);
        }
        summaries.insert(summary.user_id.clone(), summary);
        Ok(WriteOutcome::Written)
    }

    async fn get_summary(&self, user_id: &AggregateId) -> Result<Option<UserSummary>> {
        Ok(self.summaries.read().await.get(user_id).cloned())
    }

    async fn scan_summaries(&self, request: ScanRequest) -> Result<Page<UserSummary>> {
        if request.limit == 0 {
            return Err(ProjectionError::ReadModel(
                "scan limit must be positive".to_string(),
            ));
        }

        let summaries = self.summaries.read().await;
        let lower = match &request.start_after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let mut range = summaries.range::<AggregateId, _>((lower, Bound::Unbounded));

        let items: Vec<UserSummary> = range
            .by_ref()
            .take(request.limit)
            .map(|(_, s)| s.clone())
            .collect();
        let last_key = if range.next().is_some() {
            items.last().map(|s| s.user_id.clone())
        } else {
            None
        };

        Ok(Page { items, last_key })
    }

    async fn remove_summary(&self, user_id: &AggregateId) -> Result<()> {
        self.summaries.write().await.remove(user_id);
        Ok(())
    }

    async fn clear_summaries(&self) -> Result<()> {
        self.summaries.write().await.clear();
        Ok(())
    }
}

#[async_trait]
impl DetailStore for InMemoryReadModels {
    async fn put_detail_if_newer(&self, detail: UserDetail) -> Result<WriteOutcome> {
        let mut details = self.details.write().await;
        if let Some(existing) = details.get(&detail.user_id)
            && existing.last_applied_sequence >= detail.last_applied_sequence
        {
            return Ok(WriteOutcome::Stale);
        }
        details.insert(detail.user_id.clone(), detail);
        Ok(WriteOutcome::Written)
    }

    async fn adjust_balance(
        &self,
        user_id: &AggregateId,
        delta: i64,
        sequence: Sequence,
    ) -> Result<WriteOutcome> {
        let mut details = self.details.write().await;
        let Some(detail) = details.get_mut(user_id) else {
            return Ok(WriteOutcome::Missing);
        };
        if detail.last_applied_sequence >= sequence {
            return Ok(WriteOutcome::Stale);
        }

        let current = detail.balance;
        detail.balance = current.checked_add(delta).ok_or_else(|| {
            ProjectionError::ReadModel(format!(
                "balance overflow for {user_id}: {current} + {delta}"
            ))
        })?;
        detail.last_applied_sequence = sequence;
        Ok(WriteOutcome::Written)
    }

    async fn get_detail(&self, user_id: &AggregateId) -> Result<Option<UserDetail>> {
        Ok(self.details.read().await.get(user_id).cloned())
    }

    async fn remove_detail(&self, user_id: &AggregateId) -> Result<()> {
        self.details.write().await.remove(user_id);
        Ok(())
    }

    async fn clear_details(&self) -> Result<()> {
        self.details.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, name: &str, seq: i64) -> UserSummary {
        UserSummary {
            user_id: AggregateId::new(id),
            name: name.to_string(),
            last_applied_sequence: Sequence::new(seq),
        }
    }

    fn detail(id: &str, seq: i64) -> UserDetail {
        UserDetail {
            user_id: AggregateId::new(id),
            name: "Alice".to_string(),
            email: "alice@x.com".to_string(),
            balance: 0,
            last_applied_sequence: Sequence::new(seq),
        }
    }

    #[tokio::test]
    async fn summary_write_requires_newer_sequence() {
        let models = InMemoryReadModels::new();

        assert_eq!(
            models.put_summary_if_newer(summary("u1", "Alice", 1)).await.unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            models.put_summary_if_newer(summary("u1", "Mallory", 1)).await.unwrap(),
            WriteOutcome::Stale
        );
        assert_eq!(
            models.put_summary_if_newer(summary("u1", "Bob", 3)).await.unwrap(),
            WriteOutcome::Written
        );

        let stored = models.get_summary(&AggregateId::new("u1")).await.unwrap().unwrap();
        assert_eq!(stored.name, "Bob");
    }

    #[tokio::test]
    async fn adjust_balance_skips_applied_sequences() {
        let models = InMemoryReadModels::new();
        let id = AggregateId::new("u1");
        models.put_detail_if_newer(detail("u1", 1)).await.unwrap();

        assert_eq!(
            models.adjust_balance(&id, 50, Sequence::new(2)).await.unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            models.adjust_balance(&id, -20, Sequence::new(3)).await.unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            models.adjust_balance(&id, 50, Sequence::new(2)).await.unwrap(),
            WriteOutcome::Stale
        );

        let stored = models.get_detail(&id).await.unwrap().unwrap();
        assert_eq!(stored.balance, 30);
        assert_eq!(stored.last_applied_sequence, Sequence::new(3));
    }

    #[tokio::test]
    async fn adjust_balance_without_record_is_missing() {
        let models = InMemoryReadModels::new();
        let outcome = models
            .adjust_balance(&AggregateId::new("ghost"), 10, Sequence::first())
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Missing);
        assert_eq!(models.detail_count().await, 0);
    }

    #[tokio::test]
    async fn adjust_balance_overflow_is_an_error() {
        let models = InMemoryReadModels::new();
        let id = AggregateId::new("u1");
        models.put_detail_if_newer(detail("u1", 1)).await.unwrap();
        models.adjust_balance(&id, i64::MAX, Sequence::new(2)).await.unwrap();

        let result = models.adjust_balance(&id, 1, Sequence::new(3)).await;
        assert!(matches!(result, Err(ProjectionError::ReadModel(_))));

        let stored = models.get_detail(&id).await.unwrap().unwrap();
        assert_eq!(stored.last_applied_sequence, Sequence::new(2));
    }

    #[tokio::test]
    async fn scan_pages_in_key_order() {
        let models = InMemoryReadModels::new();
        for id in ["u3", "u1", "u5", "u2", "u4"] {
            models.put_summary_if_newer(summary(id, id, 1)).await.unwrap();
        }

        let first = models.scan_summaries(ScanRequest::first(2)).await.unwrap();
        let ids: Vec<_> = first.items.iter().map(|s| s.user_id.as_str()).collect();
        assert_eq!(ids, ["u1", "u2"]);
        assert_eq!(first.last_key, Some(AggregateId::new("u2")));

        let second = models
            .scan_summaries(ScanRequest::after(AggregateId::new("u2"), 2))
            .await
            .unwrap();
        let ids: Vec<_> = second.items.iter().map(|s| s.user_id.as_str()).collect();
        assert_eq!(ids, ["u3", "u4"]);

        let last = models
            .scan_summaries(ScanRequest::after(AggregateId::new("u4"), 2))
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.last_key, None);
    }

    #[tokio::test]
    async fn scan_rejects_zero_limit() {
        let models = InMemoryReadModels::new();
        assert!(models.scan_summaries(ScanRequest::first(0)).await.is_err());
    }

    #[tokio::test]
    async fn clear_empties_both_maps() {
        let models = InMemoryReadModels::new();
        models.put_summary_if_newer(summary("u1", "Alice", 1)).await.unwrap();
        models.put_detail_if_newer(detail("u1", 1)).await.unwrap();

        models.clear_summaries().await.unwrap();
        models.clear_details().await.unwrap();

        assert_eq!(models.summary_count().await, 0);
        assert_eq!(models.detail_count().await, 0);
    }

    #[tokio::test]
    async fn remove_drops_one_user_and_lifts_the_sequence_guard() {
        let models = InMemoryReadModels::new();
        models.put_detail_if_newer(detail("u1", 3)).await.unwrap();
        models.put_detail_if_newer(detail("u2", 1)).await.unwrap();
        models.put_summary_if_newer(summary("u1", "Alice", 3)).await.unwrap();

        models.remove_detail(&AggregateId::new("u1")).await.unwrap();
        models.remove_summary(&AggregateId::new("u1")).await.unwrap();

        assert_eq!(models.detail_count().await, 1);
        assert_eq!(models.summary_count().await, 0);
        assert_eq!(
            models.put_detail_if_newer(detail("u1", 1)).await.unwrap(),
            WriteOutcome::Written
        );
    }
}
