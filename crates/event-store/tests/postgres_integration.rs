//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency and truncate
//! the events table between tests, so they run serially.
//! Run with:
//!
//! ```bash
//! cargo test -p event-store --test postgres_integration
//! ```

use std::sync::Arc;

use event_store::{
    AggregateId, ChangeFeed, ChangeKind, EventQuery, EventStore, EventStoreExt, FeedPosition,
    NewEvent, PostgresEventStore, Sequence,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            for migration in [
                include_str!("../../../migrations/001_create_events_table.sql"),
                include_str!("../../../migrations/002_add_transaction_id.sql"),
            ] {
                sqlx::raw_sql(migration).execute(&temp_pool).await.unwrap();
            }

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and an empty events table
async fn get_test_store() -> PostgresEventStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE events RESTART IDENTITY")
        .execute(&pool)
        .await
        .unwrap();

    PostgresEventStore::new(pool)
}

fn new_event(aggregate_id: &str, event_type: &str) -> NewEvent {
    NewEvent::new(aggregate_id, event_type, serde_json::json!({"test": true}))
}

#[tokio::test]
#[serial]
async fn append_and_retrieve_events() {
    let store = get_test_store().await;

    let result = store.append(new_event("user-001", "USER_CREATED")).await.unwrap();
    assert_eq!(result.event.sequence, Sequence::first());
    assert!(!result.deduplicated);

    let events = store
        .get_events_for_aggregate(&AggregateId::new("user-001"))
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "USER_CREATED");
    assert_eq!(events[0].payload, serde_json::json!({"test": true}));
    assert_eq!(events[0].event_id, result.event.event_id);
}

#[tokio::test]
#[serial]
async fn sequences_increase_per_aggregate() {
    let store = get_test_store().await;

    store.append(new_event("user-a", "E1")).await.unwrap();
    store.append(new_event("user-b", "E1")).await.unwrap();
    let a2 = store.append(new_event("user-a", "E2")).await.unwrap();

    assert_eq!(a2.event.sequence, Sequence::new(2));
    assert_eq!(
        store
            .current_sequence(&AggregateId::new("user-b"))
            .await
            .unwrap(),
        Some(Sequence::first())
    );
}

#[tokio::test]
#[serial]
async fn concurrent_appends_to_one_aggregate_get_distinct_sequences() {
    let store = get_test_store().await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.append(new_event("user-001", "USER_BALANCE")).await })
        })
        .collect();

    let mut sequences = Vec::new();
    for handle in handles {
        sequences.push(handle.await.unwrap().unwrap().event.sequence.as_i64());
    }
    sequences.sort_unstable();

    assert_eq!(sequences, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
#[serial]
async fn idempotency_key_returns_original_event() {
    let store = get_test_store().await;

    let first = store
        .append(new_event("user-001", "USER_BALANCE").with_idempotency_key("req-42"))
        .await
        .unwrap();
    let again = store
        .append(new_event("user-001", "USER_BALANCE").with_idempotency_key("req-42"))
        .await
        .unwrap();

    assert!(again.deduplicated);
    assert_eq!(again.event.event_id, first.event.event_id);
    assert_eq!(again.event.sequence, first.event.sequence);

    let events = store
        .get_events_for_aggregate(&AggregateId::new("user-001"))
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
#[serial]
async fn query_events_with_filters() {
    let store = get_test_store().await;
    for event_type in ["USER_CREATED", "USER_BALANCE", "USER_BALANCE", "USER_BALANCE"] {
        store.append(new_event("user-001", event_type)).await.unwrap();
    }

    let query = EventQuery::for_aggregate("user-001")
        .event_type("USER_BALANCE")
        .from_sequence(Sequence::new(3))
        .limit(5)
        .offset(0);
    let results = store.query_events(query).await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].sequence, Sequence::new(3));
    assert_eq!(results[1].sequence, Sequence::new(4));
}

#[tokio::test]
#[serial]
async fn stream_all_events_in_commit_order() {
    use futures_util::StreamExt;

    let store = get_test_store().await;
    store.append(new_event("user-b", "E1")).await.unwrap();
    store.append(new_event("user-a", "E1")).await.unwrap();

    let events: Vec<_> = store.stream_all_events().await.unwrap().collect().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].as_ref().unwrap().aggregate_id.as_str(), "user-b");
    assert_eq!(events[1].as_ref().unwrap().aggregate_id.as_str(), "user-a");
}

#[tokio::test]
#[serial]
async fn aggregate_exists_extension() {
    let store = get_test_store().await;
    let id = AggregateId::new("user-001");

    assert!(!store.aggregate_exists(&id).await.unwrap());

    let sequence = store
        .append_event(id.clone(), "USER_CREATED", serde_json::json!({"name": "Alice"}))
        .await
        .unwrap();

    assert_eq!(sequence, Sequence::first());
    assert!(store.aggregate_exists(&id).await.unwrap());
}

#[tokio::test]
#[serial]
async fn change_feed_returns_committed_events_by_position() {
    let store = get_test_store().await;
    for i in 0..3 {
        store
            .append(new_event(&format!("user-{i}"), "USER_CREATED"))
            .await
            .unwrap();
    }

    let batch = store.poll(FeedPosition::start(), 2).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.records[0].event_name, ChangeKind::Insert);
    let image = batch.records[0].new_image.as_ref().unwrap();
    assert_eq!(image.aggregate_id, "user-0");
    assert_eq!(image.sequence, 1);

    let last = batch.last_position().unwrap();
    let rest = store.poll(last, 10).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest.records[0].new_image.as_ref().unwrap().aggregate_id, "user-2");

    // Redelivery: polling from the start again returns the same records.
    let again = store.poll(FeedPosition::start(), 2).await.unwrap();
    assert_eq!(again, batch);
}

#[tokio::test]
#[serial]
async fn transaction_ids_compare_against_the_snapshot_horizon() {
    let store = get_test_store().await;
    store.append(new_event("user-001", "E1")).await.unwrap();

    // Read back as 64-bit values; the stored id must sit below the horizon
    // of any later snapshot, or the feed would hide committed rows.
    let (transaction_id, horizon): (i64, i64) = sqlx::query_as(
        "SELECT transaction_id, txid_snapshot_xmin(txid_current_snapshot())::text::bigint FROM events",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert!(transaction_id > 0);
    assert!(transaction_id < horizon);

    let batch = store.poll(FeedPosition::start(), 10).await.unwrap();
    assert_eq!(batch.len(), 1);
}

#[tokio::test]
#[serial]
async fn unique_constraint_rejects_duplicate_sequence() {
    let store = get_test_store().await;
    store.append(new_event("user-001", "E1")).await.unwrap();

    let result = sqlx::query(
        "INSERT INTO events (event_id, aggregate_id, sequence, event_type, payload) VALUES ($1, $2, 1, 'E1', '{}')",
    )
    .bind(uuid::Uuid::new_v4())
    .bind("user-001")
    .execute(store.pool())
    .await;

    assert!(result.is_err());
}
