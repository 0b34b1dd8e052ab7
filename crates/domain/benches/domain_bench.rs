use criterion::{Criterion, criterion_group, criterion_main};
use domain::{CommandIngestor, SubmitCommand, USER_BALANCE, USER_CREATED, UserEvent};
use event_store::InMemoryEventStore;

fn bench_parse_command(c: &mut Criterion) {
    let body = serde_json::to_vec(&serde_json::json!({
        "user_id": "user-001",
        "event_type": USER_CREATED,
        "payload": {"name": "Alice", "email": "alice@x.com"}
    }))
    .unwrap();

    c.bench_function("domain/parse_command", |b| {
        b.iter(|| SubmitCommand::parse(&body).unwrap());
    });
}

fn bench_decode_user_events(c: &mut Criterion) {
    let created = serde_json::json!({"name": "Alice", "email": "alice@x.com"});
    let balance = serde_json::json!({"delta": 50});

    c.bench_function("domain/decode_user_events", |b| {
        b.iter(|| {
            UserEvent::decode(USER_CREATED, &created).unwrap();
            UserEvent::decode(USER_BALANCE, &balance).unwrap();
        });
    });
}

fn bench_ingest(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ingestor = CommandIngestor::new(InMemoryEventStore::new());
    let body = serde_json::to_vec(&serde_json::json!({
        "user_id": "user-001",
        "event_type": USER_BALANCE,
        "payload": {"delta": 1}
    }))
    .unwrap();

    c.bench_function("domain/ingest_balance_command", |b| {
        b.iter(|| {
            rt.block_on(async {
                ingestor.ingest_body(&body).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_parse_command,
    bench_decode_user_events,
    bench_ingest,
);
criterion_main!(benches);
