//! User domain events.
//!
//! The store keeps payloads untyped. This module is the one place that knows
//! how each event type's payload is shaped; everything downstream matches on
//! [`UserEvent`] instead of probing JSON fields.

use serde::{Deserialize, Serialize};

/// Event type tag for user creation.
pub const USER_CREATED: &str = "USER_CREATED";

/// Event type tag for an additive balance change.
pub const USER_BALANCE: &str = "USER_BALANCE";

/// Name projected when a creation payload carries none.
pub const DEFAULT_NAME: &str = "NoName";

/// Email projected when a creation payload carries none.
pub const DEFAULT_EMAIL: &str = "noemail@example.com";

/// Payload of a `USER_CREATED` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreatedData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserCreatedData {
    /// The name to project, falling back to [`DEFAULT_NAME`].
    pub fn name_or_default(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }

    /// The email to project, falling back to [`DEFAULT_EMAIL`].
    pub fn email_or_default(&self) -> &str {
        self.email.as_deref().unwrap_or(DEFAULT_EMAIL)
    }
}

/// Payload of a `USER_BALANCE` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalanceData {
    /// Signed amount added to the balance.
    #[serde(default)]
    pub delta: i64,
}

/// A committed event's payload, decoded according to its event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    /// The user was created.
    Created(UserCreatedData),

    /// The user's balance changed by `delta`.
    BalanceAdjusted(UserBalanceData),

    /// An event type this version does not project. Producers may emit new
    /// types before consumers learn them, so this is not an error.
    Unknown { event_type: String },
}

impl UserEvent {
    /// Decodes `payload` according to `event_type`.
    ///
    /// Fails only for known types whose payload does not have the expected
    /// shape; such an event can never be projected.
    pub fn decode(event_type: &str, payload: &serde_json::Value) -> serde_json::Result<Self> {
        match event_type {
            USER_CREATED => Ok(UserEvent::Created(UserCreatedData::deserialize(payload)?)),
            USER_BALANCE => Ok(UserEvent::BalanceAdjusted(UserBalanceData::deserialize(
                payload,
            )?)),
            other => Ok(UserEvent::Unknown {
                event_type: other.to_string(),
            }),
        }
    }

    /// Returns the event type tag.
    pub fn event_type(&self) -> &str {
        match self {
            UserEvent::Created(_) => USER_CREATED,
            UserEvent::BalanceAdjusted(_) => USER_BALANCE,
            UserEvent::Unknown { event_type } => event_type,
        }
    }

    /// Encodes the payload for appending. Unknown events have an empty payload.
    pub fn to_payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            UserEvent::Created(data) => serde_json::to_value(data),
            UserEvent::BalanceAdjusted(data) => serde_json::to_value(data),
            UserEvent::Unknown { .. } => Ok(serde_json::json!({})),
        }
    }
}

// Convenience constructors for events
impl UserEvent {
    /// Creates a USER_CREATED event.
    pub fn created(name: impl Into<String>, email: impl Into<String>) -> Self {
        UserEvent::Created(UserCreatedData {
            name: Some(name.into()),
            email: Some(email.into()),
        })
    }

    /// Creates a USER_BALANCE event.
    pub fn balance(delta: i64) -> Self {
        UserEvent::BalanceAdjusted(UserBalanceData { delta })
    }
}
