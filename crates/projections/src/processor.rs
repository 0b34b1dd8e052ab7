//! Projection processor: turns change-feed batches into read-model updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use common::AggregateId;
use domain::UserEvent;
use event_store::{
    ChangeBatch, ChangeKind, ChangeRecord, EventEnvelope, EventStore, FeedPosition, Sequence,
};
use futures_util::StreamExt;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::dead_letter::{DeadLetter, DeadLetterQueue, DeadLetterReason};
use crate::projection::{ApplyOutcome, Projection};
use crate::retry::RetryPolicy;
use crate::{ProjectionError, Result};

/// Final outcome of one change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventOutcome {
    /// At least one read model changed.
    Applied,
    /// Every read model had already seen this event.
    Duplicate,
    /// No projection handles this event type.
    Ignored,
    /// The record describes a change that is not projected (MODIFY, REMOVE).
    Skipped,
    /// The record was handed to the dead-letter queue.
    DeadLettered { reason: DeadLetterReason },
}

impl From<ApplyOutcome> for EventOutcome {
    fn from(outcome: ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Applied => EventOutcome::Applied,
            ApplyOutcome::Duplicate => EventOutcome::Duplicate,
            ApplyOutcome::Ignored => EventOutcome::Ignored,
        }
    }
}

/// Outcome of one record, identified by what the record itself carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<FeedPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    #[serde(flatten)]
    pub outcome: EventOutcome,
}

impl RecordReport {
    fn for_record(record: &ChangeRecord, outcome: EventOutcome) -> Self {
        let image = record.new_image.as_ref();
        Self {
            position: record.position,
            aggregate_id: image.map(|i| i.aggregate_id.clone()),
            sequence: image.map(|i| i.sequence),
            outcome,
        }
    }
}

/// Per-record outcomes of a batch, in delivery order, with totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub skipped: usize,
    pub dead_lettered: usize,
    pub records: Vec<RecordReport>,
}

impl BatchReport {
    pub fn from_records(records: Vec<RecordReport>) -> Self {
        let mut report = BatchReport {
            total: records.len(),
            ..Default::default()
        };
        for record in &records {
            match record.outcome {
                EventOutcome::Applied => report.applied += 1,
                EventOutcome::Duplicate => report.duplicates += 1,
                EventOutcome::Ignored => report.ignored += 1,
                EventOutcome::Skipped => report.skipped += 1,
                EventOutcome::DeadLettered { .. } => report.dead_lettered += 1,
            }
        }
        report.records = records;
        report
    }

    /// Outcomes only, in delivery order.
    pub fn outcomes(&self) -> Vec<EventOutcome> {
        self.records.iter().map(|r| r.outcome).collect()
    }
}

/// Delivers committed events to the registered projections.
///
/// A batch is split by aggregate. Aggregates are processed concurrently;
/// the events of one aggregate are applied one at a time in delivery order.
/// Once one of them fails for good the aggregate is blocked at that
/// sequence: its later events, in this batch and in every later one, are
/// dead-lettered instead of applied until the failed event is redelivered
/// and succeeds or the aggregate is rebuilt. A failure never stops the
/// batch as a whole.
pub struct ProjectionProcessor<S: EventStore> {
    store: S,
    projections: Vec<Box<dyn Projection>>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    retry: RetryPolicy,
    /// Aggregate -> sequence of its earliest unresolved failed event.
    blocked: RwLock<HashMap<AggregateId, Sequence>>,
}

impl<S: EventStore> ProjectionProcessor<S> {
    /// Creates a processor that replays from `store` and reports failures to `dead_letters`.
    pub fn new(store: S, dead_letters: Arc<dyn DeadLetterQueue>) -> Self {
        Self {
            store,
            projections: Vec::new(),
            dead_letters,
            retry: RetryPolicy::default(),
            blocked: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Registers a projection with this processor.
    pub fn register(&mut self, projection: Box<dyn Projection>) {
        self.projections.push(projection);
    }

    /// Returns the number of registered projections.
    pub fn projection_count(&self) -> usize {
        self.projections.len()
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterQueue> {
        &self.dead_letters
    }

    /// Returns the sequence of the failed event holding `aggregate_id` back.
    pub async fn blocked_at(&self, aggregate_id: &AggregateId) -> Option<Sequence> {
        self.blocked.read().await.get(aggregate_id).copied()
    }

    /// Every blocked aggregate with the sequence it is blocked at.
    pub async fn blocked_aggregates(&self) -> Vec<(AggregateId, Sequence)> {
        let mut blocked: Vec<_> = self
            .blocked
            .read()
            .await
            .iter()
            .map(|(id, seq)| (id.clone(), *seq))
            .collect();
        blocked.sort();
        blocked
    }

    /// Processes one change-feed batch. Never fails as a whole; the report
    /// says what happened to each record.
    #[tracing::instrument(skip(self, batch), fields(records = batch.len()))]
    pub async fn process_batch(&self, batch: ChangeBatch) -> BatchReport {
        let started = Instant::now();
        let mut slots: Vec<Option<RecordReport>> = vec![None; batch.len()];
        let mut groups: Vec<Vec<(usize, ChangeRecord)>> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();

        for (index, record) in batch.records.into_iter().enumerate() {
            let key = record.new_image.as_ref().map(|i| i.aggregate_id.clone());
            match (record.event_name, key) {
                (ChangeKind::Insert, Some(key)) => {
                    let slot = *group_index
                        .entry(key)
                        .or_insert_with(|| {
                            groups.push(Vec::new());
                            groups.len() - 1
                        });
                    groups[slot].push((index, record));
                }
                (ChangeKind::Insert, None) => {
                    let outcome = self
                        .dead_letter(
                            &record,
                            DeadLetterReason::MalformedPayload,
                            "INSERT record carries no newImage",
                            0,
                        )
                        .await;
                    slots[index] = Some(RecordReport::for_record(&record, outcome));
                }
                (kind, _) => {
                    tracing::debug!(?kind, "skipping non-insert change record");
                    slots[index] = Some(RecordReport::for_record(&record, EventOutcome::Skipped));
                }
            }
        }

        let results = join_all(groups.into_iter().map(|group| self.process_group(group))).await;
        for (index, report) in results.into_iter().flatten() {
            slots[index] = Some(report);
        }

        let report = BatchReport::from_records(slots.into_iter().flatten().collect());

        metrics::histogram!("projection_batch_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::info!(
            total = report.total,
            applied = report.applied,
            duplicates = report.duplicates,
            dead_lettered = report.dead_lettered,
            "batch processed"
        );

        report
    }

    /// Applies the records of one aggregate sequentially.
    async fn process_group(&self, group: Vec<(usize, ChangeRecord)>) -> Vec<(usize, RecordReport)> {
        let mut reports = Vec::with_capacity(group.len());
        for (index, record) in group {
            let outcome = self.process_in_order(&record).await;
            reports.push((index, RecordReport::for_record(&record, outcome)));
        }
        reports
    }

    /// Applies one record unless an earlier event of its aggregate is still
    /// unresolved.
    async fn process_in_order(&self, record: &ChangeRecord) -> EventOutcome {
        let Some(image) = record.new_image.as_ref() else {
            return self
                .dead_letter(
                    record,
                    DeadLetterReason::MalformedPayload,
                    "record carries no newImage",
                    0,
                )
                .await;
        };
        let aggregate_id = AggregateId::new(image.aggregate_id.as_str());
        let sequence = Sequence::new(image.sequence);

        if let Some(failed) = self.blocked_at(&aggregate_id).await
            && sequence > failed
        {
            let cause =
                format!("earlier event (sequence {failed}) of {aggregate_id} is unresolved");
            return self
                .dead_letter(record, DeadLetterReason::BlockedByEarlierFailure, cause, 0)
                .await;
        }

        match self.process_record(record).await {
            Ok(outcome) => {
                self.resolve(&aggregate_id, sequence).await;
                outcome.into()
            }
            Err(Failure::Malformed(error)) => {
                self.dead_letter(record, DeadLetterReason::MalformedPayload, error, 0)
                    .await
            }
            Err(Failure::Apply { error, attempts }) => {
                self.block(aggregate_id, sequence).await;
                self.dead_letter(record, DeadLetterReason::ApplyFailed, error, attempts)
                    .await
            }
        }
    }

    async fn block(&self, aggregate_id: AggregateId, sequence: Sequence) {
        let mut blocked = self.blocked.write().await;
        let failed = blocked.entry(aggregate_id.clone()).or_insert(sequence);
        *failed = (*failed).min(sequence);
        tracing::warn!(%aggregate_id, sequence = %failed, "aggregate blocked");
        metrics::gauge!("projection_blocked_aggregates").set(blocked.len() as f64);
    }

    /// Unblocks `aggregate_id` when `sequence` is the event it was blocked at.
    async fn resolve(&self, aggregate_id: &AggregateId, sequence: Sequence) {
        if self.blocked_at(aggregate_id).await != Some(sequence) {
            return;
        }
        let mut blocked = self.blocked.write().await;
        if blocked.get(aggregate_id) == Some(&sequence) {
            blocked.remove(aggregate_id);
            tracing::info!(%aggregate_id, %sequence, "blocked aggregate resolved");
            metrics::gauge!("projection_blocked_aggregates").set(blocked.len() as f64);
        }
    }

    async fn unblock(&self, aggregate_id: Option<&AggregateId>) {
        let mut blocked = self.blocked.write().await;
        match aggregate_id {
            Some(id) => {
                blocked.remove(id);
            }
            None => blocked.clear(),
        }
        metrics::gauge!("projection_blocked_aggregates").set(blocked.len() as f64);
    }

    async fn process_record(&self, record: &ChangeRecord) -> std::result::Result<ApplyOutcome, Failure> {
        let image = record
            .new_image
            .as_ref()
            .ok_or_else(|| Failure::Malformed("record carries no newImage".to_string()))?;
        let envelope = image
            .decode()
            .map_err(|e| Failure::Malformed(e.to_string()))?;
        let event = UserEvent::decode(&envelope.event_type, &envelope.payload)
            .map_err(|e| Failure::Malformed(format!("{} payload: {e}", envelope.event_type)))?;

        self.apply_with_retry(&envelope, &event)
            .await
            .map_err(|(error, attempts)| Failure::Apply {
                error: error.to_string(),
                attempts,
            })
    }

    /// Delivers a single committed event to every projection, retrying
    /// failures according to the retry policy.
    #[tracing::instrument(skip(self, envelope), fields(aggregate_id = %envelope.aggregate_id, sequence = %envelope.sequence))]
    pub async fn process_event(&self, envelope: &EventEnvelope) -> Result<ApplyOutcome> {
        let event = UserEvent::decode(&envelope.event_type, &envelope.payload)?;
        self.apply_with_retry(envelope, &event)
            .await
            .map_err(|(error, _)| error)
    }

    async fn apply_with_retry(
        &self,
        envelope: &EventEnvelope,
        event: &UserEvent,
    ) -> std::result::Result<ApplyOutcome, (ProjectionError, u32)> {
        let mut delays = self.retry.delays();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.apply_all(envelope, event).await {
                Ok(outcome) => {
                    record_outcome(outcome);
                    return Ok(outcome);
                }
                Err(error) => match delays.next() {
                    Some(delay) => {
                        tracing::warn!(
                            aggregate_id = %envelope.aggregate_id,
                            sequence = %envelope.sequence,
                            attempt = attempts,
                            error = %error,
                            "apply failed, retrying"
                        );
                        metrics::counter!("projection_retries_total").increment(1);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err((error, attempts)),
                },
            }
        }
    }

    /// Applies one event to every projection. Projections that already saw
    /// the event report a duplicate, so re-running after a partial failure
    /// is safe.
    async fn apply_all(&self, envelope: &EventEnvelope, event: &UserEvent) -> Result<ApplyOutcome> {
        let mut combined = ApplyOutcome::Ignored;
        for projection in &self.projections {
            let outcome = projection.apply(envelope, event).await.map_err(|e| {
                tracing::error!(projection = projection.name(), error = %e, "projection apply failed");
                e
            })?;
            combined = combined.merge(outcome);
        }
        Ok(combined)
    }

    async fn dead_letter(
        &self,
        record: &ChangeRecord,
        reason: DeadLetterReason,
        error: impl Into<String>,
        attempts: u32,
    ) -> EventOutcome {
        self.push_dead_letter(DeadLetter::new(record, reason, error, attempts))
            .await
    }

    async fn push_dead_letter(&self, entry: DeadLetter) -> EventOutcome {
        let reason = entry.reason;
        if let Err(e) = self.dead_letters.push(entry).await {
            tracing::error!(error = %e, %reason, "failed to write dead letter");
        }
        EventOutcome::DeadLettered { reason }
    }

    /// Processes records as they arrive from an external trigger, before
    /// they are known to be well-formed. A record that is not a readable
    /// change record is dead-lettered on its own; the rest go through
    /// [`process_batch`](Self::process_batch).
    pub async fn process_raw_records(&self, raw: Vec<serde_json::Value>) -> BatchReport {
        let mut slots: Vec<Option<RecordReport>> = vec![None; raw.len()];
        let mut indices = Vec::with_capacity(raw.len());
        let mut records = Vec::with_capacity(raw.len());

        for (index, value) in raw.into_iter().enumerate() {
            match ChangeRecord::deserialize(&value) {
                Ok(record) => {
                    indices.push(index);
                    records.push(record);
                }
                Err(e) => {
                    let entry = DeadLetter::from_raw(
                        value,
                        DeadLetterReason::MalformedPayload,
                        format!("unreadable change record: {e}"),
                    );
                    let aggregate_id = entry.aggregate_id.clone();
                    let sequence = entry.sequence;
                    let outcome = self.push_dead_letter(entry).await;
                    slots[index] = Some(RecordReport {
                        position: None,
                        aggregate_id,
                        sequence,
                        outcome,
                    });
                }
            }
        }

        let processed = self.process_batch(ChangeBatch::new(records)).await;
        for (index, report) in indices.into_iter().zip(processed.records) {
            slots[index] = Some(report);
        }

        BatchReport::from_records(slots.into_iter().flatten().collect())
    }

    /// Resets all projections and replays every committed event.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_all(&self) -> Result<BatchReport> {
        for projection in &self.projections {
            projection.reset().await?;
        }
        self.unblock(None).await;

        let mut stream = self.store.stream_all_events().await?;
        let mut events = Vec::new();
        while let Some(result) = stream.next().await {
            events.push(result?);
        }

        let report = self.process_batch(replay_batch(&events)?).await;
        tracing::info!(events = report.total, "rebuild complete");
        Ok(report)
    }

    /// Re-folds one aggregate from its first event.
    ///
    /// The aggregate's read-model records are dropped and its blocked state
    /// cleared before the replay, so an event that was dead-lettered and
    /// then overtaken by newer ones is applied in order this time.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_aggregate(&self, aggregate_id: &AggregateId) -> Result<BatchReport> {
        let events = self.store.get_events_for_aggregate(aggregate_id).await?;
        for projection in &self.projections {
            projection.reset_aggregate(aggregate_id).await?;
        }
        self.unblock(Some(aggregate_id)).await;

        let report = self.process_batch(replay_batch(&events)?).await;
        tracing::info!(%aggregate_id, events = report.total, "aggregate rebuilt");
        Ok(report)
    }
}

/// Why a record could not be projected.
enum Failure {
    Malformed(String),
    Apply { error: String, attempts: u32 },
}

fn record_outcome(outcome: ApplyOutcome) {
    match outcome {
        ApplyOutcome::Applied => metrics::counter!("projection_events_applied_total").increment(1),
        ApplyOutcome::Duplicate => {
            metrics::counter!("projection_duplicates_skipped_total").increment(1)
        }
        ApplyOutcome::Ignored => metrics::counter!("projection_events_ignored_total").increment(1),
    }
}

/// Wraps stored events in feed records so replays share the batch pipeline.
fn replay_batch(events: &[EventEnvelope]) -> Result<ChangeBatch> {
    let records = events
        .iter()
        .enumerate()
        .map(|(index, event)| ChangeRecord::insert(event, FeedPosition::new(index as i64 + 1)))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ChangeBatch::new(records))
}
