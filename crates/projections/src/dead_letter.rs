//! Dead-letter queue for change records that could not be projected.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_store::ChangeRecord;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Result;

/// Why a record ended up in the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The record or its payload could not be decoded. Retrying cannot help.
    MalformedPayload,
    /// Applying the event kept failing until the retry budget ran out.
    ApplyFailed,
    /// An earlier event of the same aggregate in the batch failed to apply,
    /// so this one was held back to preserve per-aggregate order.
    BlockedByEarlierFailure,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::MalformedPayload => "malformed_payload",
            DeadLetterReason::ApplyFailed => "apply_failed",
            DeadLetterReason::BlockedByEarlierFailure => "blocked_by_earlier_failure",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record that was not projected, with enough context to repair and replay it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    /// The change record as it was delivered.
    pub record: serde_json::Value,
    pub aggregate_id: Option<String>,
    pub sequence: Option<i64>,
    pub reason: DeadLetterReason,
    pub error: String,
    /// Number of apply attempts made; zero for records that never decoded.
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Serializes the offending record for storage. A record that cannot be
/// serialized is logged in full and stored as `null`.
fn record_value<T: Serialize + std::fmt::Debug>(record: &T) -> serde_json::Value {
    match serde_json::to_value(record) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(error = %e, record = ?record, "failed to serialize dead-lettered record");
            serde_json::Value::Null
        }
    }
}

impl DeadLetter {
    pub fn new(
        record: &ChangeRecord,
        reason: DeadLetterReason,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        let image = record.new_image.as_ref();
        Self {
            record: record_value(record),
            aggregate_id: image.map(|i| i.aggregate_id.clone()),
            sequence: image.map(|i| i.sequence),
            reason,
            error: error.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// Builds an entry for a record that could not be read as a
    /// [`ChangeRecord`] at all, salvaging whatever identity it carries.
    pub fn from_raw(
        record: serde_json::Value,
        reason: DeadLetterReason,
        error: impl Into<String>,
    ) -> Self {
        let aggregate_id = record
            .pointer("/newImage/AggregateID")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let sequence = record
            .pointer("/newImage/Sequence")
            .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()));

        Self {
            record,
            aggregate_id,
            sequence,
            reason,
            error: error.into(),
            attempts: 0,
            failed_at: Utc::now(),
        }
    }
}

/// Operational error channel for projection failures.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn push(&self, entry: DeadLetter) -> Result<()>;

    /// Returns every entry in arrival order.
    async fn list(&self) -> Result<Vec<DeadLetter>>;
}

/// Dead-letter queue kept in process memory.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterQueue {
    entries: Arc<RwLock<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryDeadLetterQueue {
    async fn push(&self, entry: DeadLetter) -> Result<()> {
        tracing::warn!(
            aggregate_id = ?entry.aggregate_id,
            sequence = ?entry.sequence,
            reason = %entry.reason,
            attempts = entry.attempts,
            error = %entry.error,
            "change record dead-lettered"
        );
        metrics::counter!("projection_dead_lettered_total", "reason" => entry.reason.as_str())
            .increment(1);

        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.entries.read().await.clone())
    }
}
