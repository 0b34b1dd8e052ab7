//! Change feed contract between the event store and the projection engine.
//!
//! The feed hands out batches of committed events in commit order. Delivery
//! is at-least-once: a consumer owns its checkpoint and sees a batch again
//! whenever it polls from a position it has not advanced past.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{EventEnvelope, EventId, Result, Sequence};

/// Global commit position of an event within one store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FeedPosition(i64);

impl FeedPosition {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// The position before the first committed event.
    pub fn start() -> Self {
        Self(0)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for FeedPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of change a feed record describes.
///
/// The store is append-only, so only `Insert` carries meaning; the other
/// kinds are accepted so that records from a generic table stream can be
/// acknowledged without being projected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

/// Wire image of a committed event as carried by the feed.
///
/// The payload travels as JSON text, exactly as it is persisted, so that a
/// corrupted image reaches the projection engine intact and can be
/// dead-lettered instead of failing the whole batch at deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventImage {
    #[serde(rename = "AggregateID")]
    pub aggregate_id: String,

    #[serde(rename = "Sequence", deserialize_with = "sequence_from_number_or_string")]
    pub sequence: i64,

    #[serde(rename = "EventType")]
    pub event_type: String,

    #[serde(rename = "Payload")]
    pub payload: String,

    #[serde(rename = "Timestamp")]
    pub timestamp: String,

    #[serde(rename = "EventID", default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Reasons an [`EventImage`] cannot be turned back into an envelope.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("sequence must be positive, got {0}")]
    Sequence(i64),

    #[error("unrecognised timestamp {0:?}")]
    Timestamp(String),

    #[error("invalid event id: {0}")]
    EventId(#[from] uuid::Error),

    #[error("aggregate id is empty")]
    EmptyAggregateId,
}

impl EventImage {
    /// Encodes a committed envelope into its feed image.
    pub fn from_envelope(event: &EventEnvelope) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_id: event.aggregate_id.to_string(),
            sequence: event.sequence.as_i64(),
            event_type: event.event_type.clone(),
            payload: serde_json::to_string(&event.payload)?,
            timestamp: event.timestamp.to_rfc3339(),
            event_id: Some(event.event_id.to_string()),
        })
    }

    /// Decodes the image back into an envelope.
    ///
    /// Images without an `EventID` get a fresh one; idempotence is keyed on
    /// the aggregate sequence, not on the event id.
    pub fn decode(&self) -> std::result::Result<EventEnvelope, ImageError> {
        if self.aggregate_id.is_empty() {
            return Err(ImageError::EmptyAggregateId);
        }
        if self.sequence <= 0 {
            return Err(ImageError::Sequence(self.sequence));
        }
        let payload: serde_json::Value = serde_json::from_str(&self.payload)?;
        let timestamp = parse_timestamp(&self.timestamp)
            .ok_or_else(|| ImageError::Timestamp(self.timestamp.clone()))?;

        let mut builder = EventEnvelope::builder()
            .aggregate_id(self.aggregate_id.as_str())
            .sequence(Sequence::new(self.sequence))
            .event_type(self.event_type.as_str())
            .payload(payload)
            .timestamp(timestamp);
        if let Some(raw) = &self.event_id {
            builder = builder.event_id(EventId::from_uuid(Uuid::parse_str(raw)?));
        }

        Ok(builder.build())
    }
}

/// Accepts RFC 3339 as well as fractional epoch seconds (`"1700000000.25"`).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let secs: f64 = raw.parse().ok()?;
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}

fn sequence_from_number_or_string<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// One element of a change-feed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(rename = "eventName")]
    pub event_name: ChangeKind,

    #[serde(rename = "newImage", default, skip_serializing_if = "Option::is_none")]
    pub new_image: Option<EventImage>,

    /// Commit position, present when the record comes from a store feed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<FeedPosition>,
}

impl ChangeRecord {
    /// Builds the insert record for a committed event.
    pub fn insert(
        event: &EventEnvelope,
        position: FeedPosition,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self {
            event_name: ChangeKind::Insert,
            new_image: Some(EventImage::from_envelope(event)?),
            position: Some(position),
        })
    }
}

/// A batch of change records in delivery order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub records: Vec<ChangeRecord>,
}

impl ChangeBatch {
    pub fn new(records: Vec<ChangeRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest commit position in the batch, if the records carry positions.
    pub fn last_position(&self) -> Option<FeedPosition> {
        self.records.iter().filter_map(|r| r.position).max()
    }
}

/// Source of committed events for the projection engine.
///
/// Within one aggregate, records are returned in commit order. Polling the
/// same position twice returns the same records again.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Returns up to `limit` records committed after `after`.
    async fn poll(&self, after: FeedPosition, limit: usize) -> Result<ChangeBatch>;
}
