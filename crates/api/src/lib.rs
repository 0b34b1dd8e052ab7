//! HTTP API server for the user CQRS system.
//!
//! Exposes command submission and read-model queries over REST, runs the
//! change-feed worker that keeps the read models current, and carries the
//! observability stack (structured logging via tracing, Prometheus metrics).

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use domain::CommandIngestor;
use event_store::{ChangeFeed, EventStore};
use metrics_exporter_prometheus::PrometheusHandle;
use projections::{
    FeedWorker, FeedWorkerConfig, InMemoryCheckpointStore, InMemoryDeadLetterQueue,
    InMemoryReadModels, ProjectionProcessor, QueryService, RetryPolicy, UserDetailProjection,
    UserSummaryProjection,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
pub use routes::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: EventStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/command", post(routes::commands::submit::<S>))
        .route("/detail", get(routes::users::detail::<S>))
        .route("/list", get(routes::users::list::<S>))
        .route("/projection", post(routes::projection::trigger::<S>))
        .route("/events", get(routes::events::list::<S>))
        .route("/dead-letters", get(routes::dead_letters::list::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wires the ingestor, projections, read models and feed worker around
/// `event_store`.
///
/// The returned worker consumes the store's own change feed; the caller
/// decides whether to run it in the background or drive it by hand.
pub fn create_default_state<S>(
    event_store: S,
    config: &Config,
) -> (Arc<AppState<S>>, FeedWorker<S, S>)
where
    S: EventStore + ChangeFeed + Clone + 'static,
{
    let models = InMemoryReadModels::new();
    let retry = RetryPolicy::exponential(
        config.projection_retry_delay,
        config.projection_max_attempts,
    );

    let mut processor =
        ProjectionProcessor::new(event_store.clone(), Arc::new(InMemoryDeadLetterQueue::new()))
            .with_retry_policy(retry);
    processor.register(Box::new(UserSummaryProjection::new(models.clone())));
    processor.register(Box::new(UserDetailProjection::new(models.clone())));
    let processor = Arc::new(processor);

    let worker = FeedWorker::new(
        event_store.clone(),
        processor.clone(),
        Arc::new(InMemoryCheckpointStore::new()),
        FeedWorkerConfig {
            batch_size: config.feed_batch_size,
            poll_interval: config.feed_poll_interval,
            ..Default::default()
        },
    );

    let state = Arc::new(AppState {
        ingestor: CommandIngestor::with_policy(event_store.clone(), config.missing_field_policy),
        event_store,
        projection_processor: processor,
        queries: QueryService::with_page_size(models, config.summary_page_size),
        query_timeout: config.query_timeout,
    });

    (state, worker)
}
