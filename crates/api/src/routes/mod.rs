//! HTTP handlers and the state they share.

pub mod commands;
pub mod dead_letters;
pub mod events;
pub mod health;
pub mod metrics;
pub mod projection;
pub mod users;

use std::sync::Arc;
use std::time::Duration;

use domain::CommandIngestor;
use event_store::EventStore;
use projections::{InMemoryReadModels, ProjectionProcessor, QueryService};

/// Shared application state accessible from all handlers.
pub struct AppState<S: EventStore> {
    pub ingestor: CommandIngestor<S>,
    pub event_store: S,
    pub projection_processor: Arc<ProjectionProcessor<S>>,
    pub queries: QueryService<InMemoryReadModels>,
    pub query_timeout: Duration,
}
