use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, ChangeBatch, ChangeFeed, ChangeRecord, EventEnvelope, EventId, EventQuery,
    EventStoreError, FeedPosition, NewEvent, Result, Sequence,
    store::{AppendResult, AppendTimer, EventStore, EventStream, validate_new_event},
};

const EVENT_COLUMNS: &str =
    "position, event_id, aggregate_id, sequence, event_type, payload, timestamp, idempotency_key";

/// PostgreSQL-backed event store implementation.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` and returns a store over a fresh pool.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: &PgRow) -> Result<EventEnvelope> {
        let mut builder = EventEnvelope::builder()
            .event_id(EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?))
            .aggregate_id(row.try_get::<String, _>("aggregate_id")?)
            .sequence(Sequence::new(row.try_get("sequence")?))
            .event_type(row.try_get::<String, _>("event_type")?)
            .payload(row.try_get("payload")?)
            .timestamp(row.try_get("timestamp")?);
        if let Some(key) = row.try_get::<Option<String>, _>("idempotency_key")? {
            builder = builder.idempotency_key(key);
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(skip(self, event), fields(aggregate_id = %event.aggregate_id, event_type = %event.event_type))]
    async fn append(&self, event: NewEvent) -> Result<AppendResult> {
        let _timer = AppendTimer::start("postgres");
        validate_new_event(&event)?;
        let aggregate_id = event.aggregate_id.clone();

        let mut tx = self.pool.begin().await?;

        // Serialises sequence assignment per aggregate for the rest of the
        // transaction; appends for other aggregates proceed in parallel.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(aggregate_id.as_str())
            .execute(&mut *tx)
            .await?;

        if let Some(key) = &event.idempotency_key {
            let existing = sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE aggregate_id = $1 AND idempotency_key = $2"
            ))
            .bind(aggregate_id.as_str())
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                tx.rollback().await?;
                return Ok(AppendResult {
                    event: Self::row_to_event(&row)?,
                    deduplicated: true,
                });
            }
        }

        let head: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_str())
                .fetch_one(&mut *tx)
                .await?;
        let sequence = Sequence::new(head.unwrap_or(0)).next();

        let envelope = EventEnvelope::commit(event, sequence);

        sqlx::query(
            r#"
            INSERT INTO events (event_id, aggregate_id, sequence, event_type, payload, timestamp, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(envelope.event_id.as_uuid())
        .bind(envelope.aggregate_id.as_str())
        .bind(envelope.sequence.as_i64())
        .bind(&envelope.event_type)
        .bind(&envelope.payload)
        .bind(envelope.timestamp)
        .bind(&envelope.idempotency_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_aggregate_sequence")
            {
                return EventStoreError::SequenceConflict {
                    aggregate_id: aggregate_id.clone(),
                    sequence,
                };
            }
            EventStoreError::Database(e)
        })?;

        tx.commit().await?;

        Ok(AppendResult {
            event: envelope,
            deduplicated: false,
        })
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE aggregate_id = $1 ORDER BY sequence ASC"
        ))
        .bind(aggregate_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1=1");
        let mut param_count = 0;

        if query.aggregate_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_id = ${param_count}"));
        }
        if query.event_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ANY(${param_count})"));
        }
        if query.from_sequence.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND sequence >= ${param_count}"));
        }
        if query.to_sequence.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND sequence <= ${param_count}"));
        }

        sql.push_str(" ORDER BY position ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = &query.aggregate_id {
            sqlx_query = sqlx_query.bind(id.as_str());
        }
        if let Some(event_types) = &query.event_types {
            sqlx_query = sqlx_query.bind(event_types);
        }
        if let Some(from) = query.from_sequence {
            sqlx_query = sqlx_query.bind(from.as_i64());
        }
        if let Some(to) = query.to_sequence {
            sqlx_query = sqlx_query.bind(to.as_i64());
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        use futures_util::StreamExt;

        let stream = sqlx::query(
            r#"
            SELECT position, event_id, aggregate_id, sequence, event_type, payload, timestamp, idempotency_key
            FROM events
            ORDER BY position ASC
            "#,
        )
        .fetch(&self.pool)
        .map(|result| match result {
            Ok(row) => Self::row_to_event(&row),
            Err(e) => Err(EventStoreError::Database(e)),
        });

        Ok(Box::pin(stream))
    }

    async fn current_sequence(&self, aggregate_id: &AggregateId) -> Result<Option<Sequence>> {
        let head: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(head.map(Sequence::new))
    }
}

#[async_trait]
impl ChangeFeed for PostgresEventStore {
    async fn poll(&self, after: FeedPosition, limit: usize) -> Result<ChangeBatch> {
        // Positions come from a sequence and may commit out of order. Only
        // rows written by transactions older than every in-flight one are
        // returned, so the consumer never checkpoints past a gap that a
        // slower transaction is about to fill. Both sides of the comparison
        // are epoch-extended 64-bit transaction ids.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE position > $1
              AND transaction_id < txid_snapshot_xmin(txid_current_snapshot())
            ORDER BY position ASC
            LIMIT $2
            "#
        ))
        .bind(after.as_i64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let position = FeedPosition::new(row.try_get("position")?);
            let event = Self::row_to_event(row)?;
            records.push(ChangeRecord::insert(&event, position)?);
        }

        Ok(ChangeBatch::new(records))
    }
}
