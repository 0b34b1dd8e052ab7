//! Domain error types.

use event_store::EventStoreError;
use thiserror::Error;

/// Errors returned to the submitter of a command.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The command is malformed or missing a required field. User-correctable.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The event could not be durably committed. The outcome is unknown to
    /// the caller: retrying is only safe with an idempotency key.
    #[error("Failed to store event: {0}")]
    StoreWrite(#[source] EventStoreError),
}

impl From<EventStoreError> for DomainError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::InvalidEvent(msg) => DomainError::Validation(msg),
            other => DomainError::StoreWrite(other),
        }
    }
}
