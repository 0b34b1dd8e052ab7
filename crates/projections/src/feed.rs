//! Change-feed consumer that keeps the read models current.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use event_store::{ChangeFeed, EventStore, FeedPosition};
use tokio::sync::{RwLock, watch};

use crate::Result;
use crate::processor::{BatchReport, ProjectionProcessor};

/// Durable position of a named feed consumer.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns the last position the consumer finished, or the start of the feed.
    async fn load(&self, consumer: &str) -> Result<FeedPosition>;

    async fn save(&self, consumer: &str, position: FeedPosition) -> Result<()>;
}

/// Checkpoints kept in process memory. A restart replays from the start of
/// the feed, which the idempotent projections absorb.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    positions: Arc<RwLock<HashMap<String, FeedPosition>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, consumer: &str) -> Result<FeedPosition> {
        Ok(self
            .positions
            .read()
            .await
            .get(consumer)
            .copied()
            .unwrap_or_else(FeedPosition::start))
    }

    async fn save(&self, consumer: &str, position: FeedPosition) -> Result<()> {
        self.positions
            .write()
            .await
            .insert(consumer.to_string(), position);
        Ok(())
    }
}

/// Polling settings of a [`FeedWorker`].
#[derive(Debug, Clone)]
pub struct FeedWorkerConfig {
    /// Checkpoint key of this consumer.
    pub name: String,
    pub batch_size: usize,
    /// Sleep between polls that returned nothing.
    pub poll_interval: Duration,
}

impl Default for FeedWorkerConfig {
    fn default() -> Self {
        Self {
            name: "user-projections".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Polls a change feed, hands each batch to the processor and then
/// advances the checkpoint.
///
/// The checkpoint moves only after a batch has been fully processed, so a
/// crash in between redelivers the batch on the next run.
pub struct FeedWorker<F: ChangeFeed, S: EventStore> {
    feed: F,
    processor: Arc<ProjectionProcessor<S>>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: FeedWorkerConfig,
}

impl<F: ChangeFeed, S: EventStore> FeedWorker<F, S> {
    pub fn new(
        feed: F,
        processor: Arc<ProjectionProcessor<S>>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: FeedWorkerConfig,
    ) -> Self {
        Self {
            feed,
            processor,
            checkpoints,
            config,
        }
    }

    /// Polls once. Returns `None` when the feed had nothing new.
    #[tracing::instrument(skip(self), fields(consumer = %self.config.name))]
    pub async fn run_once(&self) -> Result<Option<BatchReport>> {
        let after = self.checkpoints.load(&self.config.name).await?;
        let batch = self.feed.poll(after, self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(None);
        }

        let next = batch.last_position();
        metrics::counter!("feed_batches_total").increment(1);
        let report = self.processor.process_batch(batch).await;

        if let Some(position) = next {
            self.checkpoints.save(&self.config.name, position).await?;
            tracing::debug!(%position, "checkpoint advanced");
        }

        Ok(Some(report))
    }

    /// Drains the feed until a poll comes back empty.
    pub async fn catch_up(&self) -> Result<usize> {
        let mut batches = 0;
        while self.run_once().await?.is_some() {
            batches += 1;
        }
        Ok(batches)
    }

    /// Polls until `shutdown` turns true. Poll errors are logged and retried
    /// after the poll interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(consumer = %self.config.name, "feed worker started");

        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::error!(error = %e, "feed poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        tracing::info!(consumer = %self.config.name, "feed worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AggregateId;
    use domain::{USER_BALANCE, USER_CREATED};
    use event_store::{EventStoreExt, InMemoryEventStore};
    use serde_json::json;

    use crate::dead_letter::InMemoryDeadLetterQueue;
    use crate::read_model::{DetailStore, InMemoryReadModels};
    use crate::views::{UserDetailProjection, UserSummaryProjection};

    fn worker(
        store: InMemoryEventStore,
        batch_size: usize,
    ) -> (
        FeedWorker<InMemoryEventStore, InMemoryEventStore>,
        InMemoryReadModels,
        InMemoryCheckpointStore,
    ) {
        let models = InMemoryReadModels::new();
        let mut processor =
            ProjectionProcessor::new(store.clone(), Arc::new(InMemoryDeadLetterQueue::new()));
        processor.register(Box::new(UserSummaryProjection::new(models.clone())));
        processor.register(Box::new(UserDetailProjection::new(models.clone())));

        let checkpoints = InMemoryCheckpointStore::new();
        let worker = FeedWorker::new(
            store,
            Arc::new(processor),
            Arc::new(checkpoints.clone()),
            FeedWorkerConfig {
                batch_size,
                poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
        );
        (worker, models, checkpoints)
    }

    async fn seed(store: &InMemoryEventStore) {
        let id = AggregateId::new("user-001");
        store
            .append_event(id.clone(), USER_CREATED, json!({"name": "Alice"}))
            .await
            .unwrap();
        store
            .append_event(id.clone(), USER_BALANCE, json!({"delta": 50}))
            .await
            .unwrap();
        store
            .append_event(id, USER_BALANCE, json!({"delta": -20}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn run_once_advances_checkpoint() {
        let store = InMemoryEventStore::new();
        seed(&store).await;
        let (worker, _, checkpoints) = worker(store, 2);

        let report = worker.run_once().await.unwrap().unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(
            checkpoints.load("user-projections").await.unwrap(),
            FeedPosition::new(2)
        );

        let report = worker.run_once().await.unwrap().unwrap();
        assert_eq!(report.total, 1);
        assert!(worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn catch_up_drains_the_feed() {
        let store = InMemoryEventStore::new();
        seed(&store).await;
        let (worker, models, _) = worker(store, 1);

        assert_eq!(worker.catch_up().await.unwrap(), 3);

        let detail = models
            .get_detail(&AggregateId::new("user-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail.balance, 30);
    }

    #[tokio::test]
    async fn lost_checkpoint_redelivers_without_double_counting() {
        let store = InMemoryEventStore::new();
        seed(&store).await;
        let (worker, models, checkpoints) = worker(store, 10);

        worker.catch_up().await.unwrap();
        checkpoints
            .save("user-projections", FeedPosition::start())
            .await
            .unwrap();

        let report = worker.run_once().await.unwrap().unwrap();
        assert_eq!(report.duplicates, 3);

        let detail = models
            .get_detail(&AggregateId::new("user-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail.balance, 30);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = InMemoryEventStore::new();
        let (worker, models, _) = worker(store.clone(), 10);
        let worker = Arc::new(worker);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(rx).await }
        });

        seed(&store).await;
        for _ in 0..200 {
            if models.detail_count().await == 1
                && models
                    .get_detail(&AggregateId::new("user-001"))
                    .await
                    .unwrap()
                    .map(|d| d.balance)
                    == Some(30)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tx.send(true).unwrap();
        handle.await.unwrap();

        let detail = models
            .get_detail(&AggregateId::new("user-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail.balance, 30);
    }
}
