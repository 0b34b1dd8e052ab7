use crate::{AggregateId, Sequence};

/// Filter for inspecting committed events.
///
/// Used by rebuild and debugging paths; projections never query the store
/// directly, they consume the change feed.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Filter by aggregate ID.
    pub aggregate_id: Option<AggregateId>,

    /// Filter by event types (any of these types).
    pub event_types: Option<Vec<String>>,

    /// Filter by minimum sequence (inclusive).
    pub from_sequence: Option<Sequence>,

    /// Filter by maximum sequence (inclusive).
    pub to_sequence: Option<Sequence>,

    /// Maximum number of events to return.
    pub limit: Option<usize>,

    /// Number of events to skip.
    pub offset: Option<usize>,
}

impl EventQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for a specific aggregate.
    pub fn for_aggregate(aggregate_id: impl Into<AggregateId>) -> Self {
        Self {
            aggregate_id: Some(aggregate_id.into()),
            ..Default::default()
        }
    }

    /// Filters by event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types = Some(vec![event_type.into()]);
        self
    }

    /// Filters by multiple event types (any of these).
    pub fn event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Filters to events starting from this sequence (inclusive).
    pub fn from_sequence(mut self, sequence: Sequence) -> Self {
        self.from_sequence = Some(sequence);
        self
    }

    /// Filters to events up to this sequence (inclusive).
    pub fn to_sequence(mut self, sequence: Sequence) -> Self {
        self.to_sequence = Some(sequence);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if the event passes every filter except limit/offset.
    pub fn matches(&self, event: &crate::EventEnvelope) -> bool {
        if let Some(id) = &self.aggregate_id
            && &event.aggregate_id != id
        {
            return false;
        }
        if let Some(types) = &self.event_types
            && !types.contains(&event.event_type)
        {
            return false;
        }
        if let Some(from) = self.from_sequence
            && event.sequence < from
        {
            return false;
        }
        if let Some(to) = self.to_sequence
            && event.sequence > to
        {
            return false;
        }
        true
    }
}
