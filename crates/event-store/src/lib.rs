pub mod error;
pub mod event;
pub mod feed;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, NewEvent, Sequence};
pub use feed::{ChangeBatch, ChangeFeed, ChangeKind, ChangeRecord, EventImage, FeedPosition, ImageError};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::EventQuery;
pub use store::{AppendResult, EventStore, EventStoreExt, EventStream};
