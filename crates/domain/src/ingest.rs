//! Command ingestion: the write side's only entry point.

use std::str::FromStr;

use common::AggregateId;
use event_store::{EventStore, NewEvent, Sequence};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Aggregate id used when a command omits `user_id` under
/// [`MissingFieldPolicy::DefaultSentinels`].
pub const UNKNOWN_AGGREGATE_ID: &str = "unknown-id";

/// Event type used when a command omits `event_type` under
/// [`MissingFieldPolicy::DefaultSentinels`].
pub const UNKNOWN_EVENT_TYPE: &str = "UNKNOWN_EVENT";

/// What to do with a command that omits `user_id` or `event_type`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingFieldPolicy {
    /// Substitute sentinel values and accept the command.
    #[default]
    DefaultSentinels,
    /// Reject the command with a validation error.
    Reject,
}

impl FromStr for MissingFieldPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" | "sentinel" | "sentinels" => Ok(Self::DefaultSentinels),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown missing-field policy: {other}")),
        }
    }
}

/// A command as submitted by a client.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubmitCommand {
    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub event_type: Option<String>,

    #[serde(default)]
    pub payload: Option<serde_json::Value>,

    /// Optional client deduplication token. Resubmitting a command with the
    /// same token for the same user returns the original acknowledgment.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl SubmitCommand {
    /// Parses a request body. An empty body is treated as `{}`.
    pub fn parse(body: &[u8]) -> Result<Self, DomainError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| DomainError::Validation(format!("Invalid JSON in request body: {e}")))
    }
}

/// Acknowledgment of a committed command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestAck {
    pub aggregate_id: AggregateId,
    pub event_type: String,
    pub sequence: Sequence,
    /// True when the idempotency key matched an earlier command.
    #[serde(skip)]
    pub deduplicated: bool,
}

impl IngestAck {
    /// Human-readable status for the response body.
    pub fn message(&self) -> &'static str {
        if self.deduplicated {
            "Event already stored"
        } else {
            "Event stored"
        }
    }
}

/// Validates commands, turns them into events and appends them.
///
/// Ingestion is stateless per call; the store handle is the only thing
/// shared between concurrent invocations. Failed appends are not retried.
pub struct CommandIngestor<S: EventStore> {
    store: S,
    policy: MissingFieldPolicy,
}

impl<S: EventStore> CommandIngestor<S> {
    /// Creates an ingestor with the default missing-field policy.
    pub fn new(store: S) -> Self {
        Self::with_policy(store, MissingFieldPolicy::default())
    }

    pub fn with_policy(store: S, policy: MissingFieldPolicy) -> Self {
        Self { store, policy }
    }

    /// Returns a reference to the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> MissingFieldPolicy {
        self.policy
    }

    /// Parses and ingests a raw request body.
    pub async fn ingest_body(&self, body: &[u8]) -> Result<IngestAck, DomainError> {
        let command = SubmitCommand::parse(body)?;
        self.ingest(command).await
    }

    /// Appends the event described by `command`.
    #[tracing::instrument(skip(self, command), fields(user_id = ?command.user_id, event_type = ?command.event_type))]
    pub async fn ingest(&self, command: SubmitCommand) -> Result<IngestAck, DomainError> {
        let event = self.to_event(command)?;
        let event_type = event.event_type.clone();

        let appended = self.store.append(event).await.map_err(|e| {
            tracing::error!(error = %e, "failed to append event");
            DomainError::from(e)
        })?;

        if appended.deduplicated {
            metrics::counter!("events_deduplicated_total").increment(1);
        } else {
            metrics::counter!("events_appended_total", "event_type" => event_type.clone())
                .increment(1);
        }
        tracing::info!(
            aggregate_id = %appended.event.aggregate_id,
            sequence = %appended.event.sequence,
            deduplicated = appended.deduplicated,
            "event stored"
        );

        Ok(IngestAck {
            aggregate_id: appended.event.aggregate_id,
            event_type,
            sequence: appended.event.sequence,
            deduplicated: appended.deduplicated,
        })
    }

    fn to_event(&self, command: SubmitCommand) -> Result<NewEvent, DomainError> {
        let user_id = self.required(command.user_id, "user_id", UNKNOWN_AGGREGATE_ID)?;
        let event_type = self.required(command.event_type, "event_type", UNKNOWN_EVENT_TYPE)?;

        let payload = match command.payload {
            None | Some(serde_json::Value::Null) => serde_json::json!({}),
            Some(value @ serde_json::Value::Object(_)) => value,
            Some(_) => {
                return Err(DomainError::Validation(
                    "payload must be a JSON object".to_string(),
                ));
            }
        };

        let mut event = NewEvent::new(user_id, event_type, payload);
        event.idempotency_key = command.idempotency_key;
        Ok(event)
    }

    fn required(
        &self,
        value: Option<String>,
        field: &str,
        sentinel: &str,
    ) -> Result<String, DomainError> {
        match value.filter(|v| !v.is_empty()) {
            Some(v) => Ok(v),
            None => match self.policy {
                MissingFieldPolicy::DefaultSentinels => Ok(sentinel.to_string()),
                MissingFieldPolicy::Reject => {
                    Err(DomainError::Validation(format!("Missing {field}")))
                }
            },
        }
    }
}
