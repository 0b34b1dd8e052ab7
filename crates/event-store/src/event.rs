use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AggregateId;

/// Globally unique identifier for a committed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Position of an event within its aggregate's history.
///
/// Sequences are assigned by the store at append time. The first event of an
/// aggregate gets 1 and every later event of the same aggregate gets a
/// strictly greater value, which is what projections compare against to
/// discard redelivered events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(i64);

impl Sequence {
    /// Creates a sequence from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// The sequence of an aggregate with no events.
    pub fn initial() -> Self {
        Self(0)
    }

    /// The sequence of an aggregate's first event.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw sequence value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Sequence {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Sequence> for i64 {
    fn from(sequence: Sequence) -> Self {
        sequence.0
    }
}

/// An event to be appended. The store assigns id, sequence and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub aggregate_id: AggregateId,
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Client-supplied deduplication token, unique per aggregate.
    pub idempotency_key: Option<String>,
}

impl NewEvent {
    pub fn new(
        aggregate_id: impl Into<AggregateId>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            idempotency_key: None,
        }
    }

    /// Attaches a deduplication token to the event.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A committed event along with the metadata the store assigned to it.
///
/// Envelopes are immutable facts: once returned by the store they are never
/// updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,

    /// Per-aggregate position assigned at append time.
    pub sequence: Sequence,

    /// The type of the event (e.g., "USER_CREATED", "USER_BALANCE").
    pub event_type: String,

    /// The event payload as JSON. Decoded per type by the projections.
    pub payload: serde_json::Value,

    /// Append-time wall clock. Informational only, never used for ordering.
    pub timestamp: DateTime<Utc>,

    /// Deduplication token the event was appended with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Stamps a new event with the store-assigned sequence.
    pub fn commit(event: NewEvent, sequence: Sequence) -> Self {
        Self {
            event_id: EventId::new(),
            aggregate_id: event.aggregate_id,
            sequence,
            event_type: event.event_type,
            payload: event.payload,
            timestamp: Utc::now(),
            idempotency_key: event.idempotency_key,
        }
    }
}

/// Builder for constructing event envelopes outside the store, e.g. when
/// decoding a change-feed image or in tests.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    aggregate_id: Option<AggregateId>,
    sequence: Option<Sequence>,
    event_type: Option<String>,
    payload: Option<serde_json::Value>,
    timestamp: Option<DateTime<Utc>>,
    idempotency_key: Option<String>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the aggregate ID.
    pub fn aggregate_id(mut self, id: impl Into<AggregateId>) -> Self {
        self.aggregate_id = Some(id.into());
        self
    }

    /// Sets the sequence.
    pub fn sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Builds the event envelope.
    ///
    /// # Panics
    ///
    /// Panics if aggregate_id, sequence or event_type are not set.
    pub fn build(self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            aggregate_id: self.aggregate_id.expect("aggregate_id is required"),
            sequence: self.sequence.expect("sequence is required"),
            event_type: self.event_type.expect("event_type is required"),
            payload: self.payload.unwrap_or_else(|| serde_json::json!({})),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            idempotency_key: self.idempotency_key,
        }
    }

    /// Tries to build the event envelope, returning None if required fields are missing.
    pub fn try_build(self) -> Option<EventEnvelope> {
        Some(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            aggregate_id: self.aggregate_id?,
            sequence: self.sequence?,
            event_type: self.event_type?,
            payload: self.payload.unwrap_or_else(|| serde_json::json!({})),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            idempotency_key: self.idempotency_key,
        })
    }
}
