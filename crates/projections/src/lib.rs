//! Read models and projections for the CQRS query side.
//!
//! This crate provides the query side of the CQRS pattern:
//! - [`Projection`] trait for folding committed events into read models
//! - [`SummaryStore`] and [`DetailStore`] with sequence-guarded writes
//! - [`ProjectionProcessor`] for applying change-feed batches with retry
//!   and dead-lettering
//! - [`FeedWorker`] for polling the store's change feed
//! - [`QueryService`] for reading the user views

pub mod dead_letter;
pub mod error;
pub mod feed;
pub mod processor;
pub mod projection;
pub mod query;
pub mod read_model;
pub mod retry;
pub mod views;

pub use dead_letter::{DeadLetter, DeadLetterQueue, DeadLetterReason, InMemoryDeadLetterQueue};
pub use error::{ProjectionError, QueryError, Result};
pub use feed::{CheckpointStore, FeedWorker, FeedWorkerConfig, InMemoryCheckpointStore};
pub use processor::{BatchReport, EventOutcome, ProjectionProcessor, RecordReport};
pub use projection::{ApplyOutcome, Projection};
pub use query::QueryService;
pub use read_model::{
    DetailStore, InMemoryReadModels, Page, ScanRequest, SummaryStore, UserDetail, UserSummary,
    WriteOutcome,
};
pub use retry::RetryPolicy;
pub use views::{UserDetailProjection, UserSummaryProjection};
