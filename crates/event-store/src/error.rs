use thiserror::Error;

use crate::{AggregateId, Sequence};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Another writer committed the same sequence for this aggregate first.
    #[error("Sequence conflict for aggregate {aggregate_id}: sequence {sequence} is already committed")]
    SequenceConflict {
        aggregate_id: AggregateId,
        sequence: Sequence,
    },

    /// The event was rejected before reaching storage.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
