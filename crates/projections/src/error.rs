//! Projection and query error types.

use common::AggregateId;
use thiserror::Error;

/// Errors that can occur while applying events to read models.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    /// Failed to deserialize an event payload.
    #[error("Event deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The read model rejected or failed a write.
    #[error("Read model error: {0}")]
    ReadModel(String),

    /// An update arrived for a record that was never created.
    #[error("No read model record for aggregate {aggregate_id}")]
    MissingRecord { aggregate_id: AggregateId },
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Errors returned to callers of the query service.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The request is missing a required parameter.
    #[error("{0}")]
    Validation(String),

    /// The requested record does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The read model could not be read.
    #[error("Read model unavailable: {0}")]
    StoreRead(#[source] ProjectionError),

    /// The caller's deadline passed before the scan finished.
    #[error("Query timed out after {0:?}")]
    Timeout(std::time::Duration),
}
