use std::sync::Arc;
use std::time::Duration;

use entitystore::envelope::{self, RawRecord};
use entitystore::log::{LogEventStore, PAGE_SIZE};
use entitystore::{
    Event, EventParseFailure, EventStore, EventStoreError, EventStream, ResourceType,
    ResourceTypeRegistry, StreamName, SubscriberCapacity,
};
use entitystore_memory::InMemoryLogConnection;
use entitystore_testing::{collect_events, drain_until_complete};
use parking_lot::Mutex;
use tracing_test::traced_test;
use uuid::Uuid;

struct Order;

fn orders() -> ResourceType {
    ResourceTypeRegistry::new()
        .register::<Order>("Order", None)
        .expect("valid resource type")
}

fn stream_name(raw: &str) -> StreamName {
    StreamName::try_new(raw).expect("valid stream name")
}

fn created(resource_type: &ResourceType, ids: std::ops::Range<i32>) -> Vec<Event> {
    ids.map(|id| Event::created(resource_type, id, "test"))
        .collect()
}

fn garbage_record() -> RawRecord {
    RawRecord {
        event_id: Uuid::now_v7(),
        event_type: "unknown".to_string(),
        data: b"{}".to_vec(),
        metadata: b"not json".to_vec(),
    }
}

fn log_store() -> (Arc<InMemoryLogConnection>, LogEventStore<InMemoryLogConnection>) {
    let connection = Arc::new(InMemoryLogConnection::new());
    let store = LogEventStore::with_shared_connection(Arc::clone(&connection));
    (connection, store)
}

#[tokio::test]
async fn enumerator_pages_through_long_streams() {
    // Given: more events than fit in one page
    let (connection, store) = log_store();
    let stream = store.stream(&stream_name("long")).await.unwrap();
    let total = i32::try_from(PAGE_SIZE).unwrap() + 100;
    stream.append(created(&orders(), 0..total)).await.unwrap();

    // When
    let events = stream.enumerator().unwrap().read_to_end().await.unwrap();

    // Then: two pages were requested and nothing was skipped or repeated
    assert_eq!(connection.read_count(), 2);
    let ids: Vec<i32> = events.iter().map(|event| event.entity_id).collect();
    assert_eq!(ids, (0..total).collect::<Vec<_>>());
}

#[tokio::test]
async fn new_generation_reads_past_the_soft_deleted_prefix() {
    // Given: a stream whose first generation was deleted
    let (connection, store) = log_store();
    let name = stream_name("generations");
    let old = store.stream(&name).await.unwrap();
    old.append(created(&orders(), 0..3)).await.unwrap();
    old.delete().await.unwrap();

    // When: the next generation appends
    let fresh = store.stream(&name).await.unwrap();
    fresh.append(created(&orders(), 10..12)).await.unwrap();

    // Then: only the new generation is visible, the log kept every record
    let events = fresh.enumerator().unwrap().read_to_end().await.unwrap();
    let ids: Vec<i32> = events.iter().map(|event| event.entity_id).collect();
    assert_eq!(ids, vec![10, 11]);
    assert_eq!(connection.raw_records(&name).len(), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn catch_up_spans_pages_and_concurrent_appends() {
    // Given: a long history
    let (_connection, store) = log_store();
    let stream = store.stream(&stream_name("catch-up")).await.unwrap();
    let resource_type = orders();
    let history = i32::try_from(PAGE_SIZE).unwrap() + 10;
    stream
        .append(created(&resource_type, 0..history))
        .await
        .unwrap();

    // When: live events arrive while history is being read
    let mut subscription = stream.subscribe_catch_up().await.unwrap();
    let writer = Arc::clone(&stream);
    let live_types = resource_type.clone();
    let appender = tokio::spawn(async move {
        for id in history..history + 50 {
            writer
                .append_one(Event::created(&live_types, id, "test"))
                .await
                .unwrap();
        }
    });
    let total = usize::try_from(history + 50).unwrap();
    let events = collect_events(&mut subscription, total, Duration::from_secs(30))
        .await
        .unwrap();
    appender.await.unwrap();

    // Then: every event exactly once, in order
    let ids: Vec<i32> = events.iter().map(|event| event.entity_id).collect();
    assert_eq!(ids, (0..history + 50).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_subscribers_hold_up_neither_writers_nor_deletion() {
    // Given: one connection, a single-slot subscriber on "idle" that never reads
    let connection = Arc::new(InMemoryLogConnection::with_subscriber_capacity(
        SubscriberCapacity::try_new(1).unwrap(),
    ));
    let store = LogEventStore::with_shared_connection(Arc::clone(&connection));
    let idle = store.stream(&stream_name("idle")).await.unwrap();
    let busy = store.stream(&stream_name("busy")).await.unwrap();
    let resource_type = orders();
    let mut subscription = idle.subscribe_catch_up().await.unwrap();

    // When
    let limit = Duration::from_secs(2);
    tokio::time::timeout(limit, idle.append(created(&resource_type, 0..2)))
        .await
        .expect("append does not wait on the subscriber")
        .unwrap();
    tokio::time::timeout(limit, busy.append(created(&resource_type, 5..7)))
        .await
        .expect("unrelated stream stays writable")
        .unwrap();
    tokio::time::timeout(limit, idle.delete())
        .await
        .expect("delete does not wait on the subscriber")
        .unwrap();

    // Then: the idle feed completes without gaps
    let delivered = drain_until_complete(&mut subscription, Duration::from_secs(5))
        .await
        .unwrap();
    let ids: Vec<i32> = delivered.iter().map(|event| event.entity_id).collect();
    assert!(ids.len() <= 2);
    assert_eq!(ids, (0..2).take(ids.len()).collect::<Vec<_>>());
    let busy_events = busy.enumerator().unwrap().read_to_end().await.unwrap();
    assert_eq!(busy_events.len(), 2);
}

#[tokio::test]
#[traced_test]
async fn undecodable_records_are_skipped_with_a_warning() {
    // Given: a garbage record between two valid ones
    let (connection, store) = log_store();
    let name = stream_name("garbage");
    let stream = store.stream(&name).await.unwrap();
    let resource_type = orders();
    stream.append_one(Event::created(&resource_type, 1, "test")).await.unwrap();
    connection.inject_raw(&name, garbage_record());
    stream.append_one(Event::created(&resource_type, 2, "test")).await.unwrap();

    // When
    let events = stream.enumerator().unwrap().read_to_end().await.unwrap();

    // Then
    let ids: Vec<i32> = events.iter().map(|event| event.entity_id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(logs_contain("skipping event that could not be parsed"));
}

#[tokio::test]
async fn parse_failures_reach_the_installed_handler() {
    // Given
    let (connection, store) = log_store();
    let name = stream_name("handler");
    let stream = store.stream(&name).await.unwrap();
    let bad = garbage_record();
    connection.inject_raw(&name, bad.clone());
    stream
        .append_one(Event::created(&orders(), 1, "test"))
        .await
        .unwrap();

    let failures: Arc<Mutex<Vec<EventParseFailure>>> = Arc::default();
    let sink = Arc::clone(&failures);
    let mut subscription = stream.subscribe_catch_up().await.unwrap();
    subscription.on_parse_failure(Arc::new(move |failure: &EventParseFailure| {
        sink.lock().push(failure.clone());
    }));

    // When
    let events = collect_events(&mut subscription, 1, Duration::from_secs(5))
        .await
        .unwrap();

    // Then: the raw record is handed over unchanged
    assert_eq!(events[0].entity_id, 1);
    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].event_number, 0);
    assert_eq!(failures[0].record, bad);
    assert_eq!(failures[0].stream, name);
}

#[tokio::test]
async fn stored_records_use_the_wire_envelope() {
    let (connection, store) = log_store();
    let name = stream_name("wire");
    let stream = store.stream(&name).await.unwrap();
    let event = Event::deleted(&orders(), 9, "auditor");

    stream.append_one(event.clone()).await.unwrap();

    let records = connection.raw_records(&name);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_type, envelope::DELETED_EVENT_TYPE);
    assert_eq!(envelope::decode(&records[0]).unwrap(), event);
}

#[tokio::test]
async fn failed_append_releases_the_writer_lock() {
    // Given: a server rejecting appends
    let (connection, store) = log_store();
    let stream = store.stream(&stream_name("flaky")).await.unwrap();
    connection.fail_appends(Some("connection reset".to_string()));

    // When
    let result = stream.append(created(&orders(), 0..2)).await;

    // Then: the error surfaces and the stream stays usable
    assert_eq!(
        result,
        Err(EventStoreError::Backend("connection reset".to_string()))
    );
    connection.fail_appends(None);
    let mut transaction = tokio::time::timeout(Duration::from_secs(5), stream.begin_transaction())
        .await
        .expect("writer lock released")
        .unwrap();
    transaction.append(Event::created(&orders(), 7, "test"));
    transaction.commit().await.unwrap();

    let events = stream.enumerator().unwrap().read_to_end().await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(!stream.is_deleted());
}

#[tokio::test]
async fn failed_commit_surfaces_the_backend_error() {
    let (connection, store) = log_store();
    let stream = store.stream(&stream_name("flaky-commit")).await.unwrap();
    let mut transaction = stream.begin_transaction().await.unwrap();
    transaction.append(Event::created(&orders(), 1, "test"));
    connection.fail_appends(Some("timeout".to_string()));

    let result = transaction.commit().await;

    assert_eq!(result, Err(EventStoreError::Backend("timeout".to_string())));
    connection.fail_appends(None);
    stream
        .append_one(Event::created(&orders(), 2, "test"))
        .await
        .unwrap();
}
