use std::sync::Arc;
use std::time::Duration;

use entitystore::{
    Event, EventStore, EventStream, ResourceType, ResourceTypeRegistry, StreamName,
    SubscriberCapacity,
};
use entitystore_memory::InMemoryEventStore;
use entitystore_testing::collect_events;
use futures::future::join_all;

struct Invoice;

fn invoices() -> ResourceType {
    ResourceTypeRegistry::new()
        .register::<Invoice>("Invoice", None)
        .expect("valid resource type")
}

fn stream_name(raw: &str) -> StreamName {
    StreamName::try_new(raw).expect("valid stream name")
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_subscribers_apply_backpressure() {
    // Given: subscribers that buffer a single event
    let store =
        InMemoryEventStore::with_subscriber_capacity(SubscriberCapacity::try_new(1).unwrap());
    let stream = store.stream(&stream_name("backpressure")).await.unwrap();
    let resource_type = invoices();
    let mut subscription = stream.subscribe_catch_up().await.unwrap();

    // When: a batch larger than the buffer is appended
    let writer = Arc::clone(&stream);
    let batch: Vec<Event> = (0..3)
        .map(|id| Event::created(&resource_type, id, "test"))
        .collect();
    let mut append = tokio::spawn(async move { writer.append(batch).await });

    // Then: the append waits for the subscriber, then completes
    assert!(tokio::time::timeout(Duration::from_millis(100), &mut append)
        .await
        .is_err());
    let events = collect_events(&mut subscription, 3, Duration::from_secs(5))
        .await
        .unwrap();
    append.await.unwrap().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(stream.events().len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn deletion_releases_a_writer_blocked_on_a_full_subscriber() {
    // Given: a writer parked on a subscriber that never reads
    let store =
        InMemoryEventStore::with_subscriber_capacity(SubscriberCapacity::try_new(1).unwrap());
    let stream = store.stream(&stream_name("blocked-delete")).await.unwrap();
    let resource_type = invoices();
    let mut subscription = stream.subscribe_catch_up().await.unwrap();
    let writer = Arc::clone(&stream);
    let batch: Vec<Event> = (0..2)
        .map(|id| Event::created(&resource_type, id, "test"))
        .collect();
    let mut append = tokio::spawn(async move { writer.append(batch).await });
    assert!(tokio::time::timeout(Duration::from_millis(100), &mut append)
        .await
        .is_err());

    // When
    tokio::time::timeout(Duration::from_secs(2), stream.delete())
        .await
        .expect("delete is not held up by the subscriber")
        .unwrap();

    // Then: the writer returns and the feed ends after its buffered event
    append.await.unwrap().unwrap();
    let first = subscription.next().await.unwrap().unwrap();
    assert_eq!(first.entity_id, 0);
    assert!(subscription.next().await.unwrap().is_none());
    assert_eq!(stream.subscriber_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn blocked_writers_only_hold_up_their_own_stream() {
    let store =
        InMemoryEventStore::with_subscriber_capacity(SubscriberCapacity::try_new(1).unwrap());
    let blocked = store.stream(&stream_name("blocked")).await.unwrap();
    let other = store.stream(&stream_name("unrelated")).await.unwrap();
    let resource_type = invoices();
    let _idle = blocked.subscribe_catch_up().await.unwrap();
    let writer = Arc::clone(&blocked);
    let batch: Vec<Event> = (0..2)
        .map(|id| Event::created(&resource_type, id, "test"))
        .collect();
    let _append = tokio::spawn(async move { writer.append(batch).await });

    tokio::time::timeout(
        Duration::from_secs(2),
        other.append_one(Event::created(&resource_type, 9, "test")),
    )
    .await
    .expect("unrelated stream stays writable")
    .unwrap();

    assert_eq!(other.events().len(), 1);
}

#[tokio::test]
async fn deletion_drops_every_subscriber() {
    let store = InMemoryEventStore::new();
    let stream = store.stream(&stream_name("drop-subscribers")).await.unwrap();
    let mut first = stream.subscribe_catch_up().await.unwrap();
    let _second = stream.subscribe_catch_up().await.unwrap();
    assert_eq!(stream.subscriber_count(), 2);

    stream.delete().await.unwrap();

    assert_eq!(stream.subscriber_count(), 0);
    assert!(first.next().await.unwrap().is_none());
}

#[tokio::test]
async fn clones_share_streams() {
    let store = InMemoryEventStore::new();
    let clone = store.clone();
    let name = stream_name("shared");

    store
        .stream(&name)
        .await
        .unwrap()
        .append_one(Event::created(&invoices(), 1, "test"))
        .await
        .unwrap();

    assert_eq!(clone.stream(&name).await.unwrap().events().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_lookups_share_one_handle() {
    let store = InMemoryEventStore::new();
    let name = stream_name("contended");

    let lookups = (0..16).map(|_| {
        let store = store.clone();
        let name = name.clone();
        tokio::spawn(async move { store.stream(&name).await.unwrap() })
    });
    let handles: Vec<_> = join_all(lookups)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert!(handles
        .iter()
        .all(|handle| Arc::ptr_eq(handle, &handles[0])));
}
