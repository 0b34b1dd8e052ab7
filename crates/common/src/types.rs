use serde::{Deserialize, Serialize};

/// Identifier of the aggregate (a user) an event describes.
///
/// Aggregate ids are caller-supplied strings such as `"user-001"`, so the
/// newtype only exists to keep them from being mixed up with event types,
/// payload fields and other plain strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

impl AggregateId {
    /// Creates an aggregate id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id, returning the owned string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AggregateId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AggregateId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<AggregateId> for String {
    fn from(id: AggregateId) -> Self {
        id.0
    }
}

impl AsRef<str> for AggregateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_id_preserves_value() {
        let id = AggregateId::new("user-001");
        assert_eq!(id.as_str(), "user-001");
        assert_eq!(id.to_string(), "user-001");
    }

    #[test]
    fn aggregate_ids_order_lexicographically() {
        let a = AggregateId::from("user-001");
        let b = AggregateId::from("user-002");
        assert!(a < b);
    }

    #[test]
    fn aggregate_id_serializes_as_plain_string() {
        let id = AggregateId::new("user-001");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"user-001\"");
        let back: AggregateId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
