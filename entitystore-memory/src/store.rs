use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use entitystore::config::SubscriberCapacity;
use entitystore::errors::{EventStoreError, EventStoreResult};
use entitystore::event::Event;
use entitystore::stream::{
    EventStore, EventStream, MetadataValue, StreamEviction, StreamHandleCache,
};
use entitystore::subscription::{
    CatchUpSubscription, EventSource, EventStreamEnumerator, SourceItem,
};
use entitystore::transaction::{EventStreamTransaction, TransactionCommit};
use entitystore::types::StreamName;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

/// Thread-safe in-memory event store for testing
#[derive(Clone)]
pub struct InMemoryEventStore {
    handles: StreamHandleCache<InMemoryEventStream>,
    subscriber_capacity: SubscriberCapacity,
}

impl InMemoryEventStore {
    /// Create a new empty in-memory event store
    pub fn new() -> Self {
        Self::with_subscriber_capacity(SubscriberCapacity::default())
    }

    /// Create a store whose subscribers buffer at most `capacity` live events
    pub fn with_subscriber_capacity(capacity: SubscriberCapacity) -> Self {
        Self {
            handles: StreamHandleCache::new(),
            subscriber_capacity: capacity,
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("cached_streams", &self.handles.len())
            .field("subscriber_capacity", &self.subscriber_capacity)
            .finish()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    type Stream = InMemoryEventStream;

    async fn stream(&self, name: &StreamName) -> EventStoreResult<Arc<Self::Stream>> {
        Ok(self
            .handles
            .get_or_insert_with(name, |eviction| InMemoryEventStream {
                name: name.clone(),
                state: Arc::new(StreamState::default()),
                lock: Arc::new(Mutex::new(())),
                subscriber_capacity: self.subscriber_capacity,
                eviction,
            }))
    }
}

#[derive(Default)]
struct StreamLog {
    events: Vec<Event>,
    metadata: HashMap<String, MetadataValue>,
    subscribers: Vec<mpsc::Sender<Event>>,
}

// Mutated only while holding the stream's writer lock; the deleted flag is
// flipped under the log lock so that subscribing never races deletion.
struct StreamState {
    log: RwLock<StreamLog>,
    deleted: AtomicBool,
    // Raised by `delete` before it queues for the writer lock, releasing an
    // appender parked on a full subscriber queue
    closing: watch::Sender<bool>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            log: RwLock::default(),
            deleted: AtomicBool::new(false),
            closing: watch::channel(false).0,
        }
    }
}

impl StreamState {
    async fn append(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }

        let subscribers = {
            let mut log = self.log.write();
            log.events.extend(events.iter().cloned());
            log.subscribers.clone()
        };

        let mut closing = self.closing.subscribe();
        let delivery = async {
            let mut any_closed = false;
            for event in &events {
                for subscriber in &subscribers {
                    if subscriber.send(event.clone()).await.is_err() {
                        any_closed = true;
                    }
                }
            }
            any_closed
        };

        tokio::select! {
            biased;
            any_closed = delivery => {
                if any_closed {
                    self.log
                        .write()
                        .subscribers
                        .retain(|subscriber| !subscriber.is_closed());
                }
            }
            () = async {
                let _ = closing.wait_for(|closed| *closed).await;
            } => {
                debug!("stream deleted while delivering to subscribers");
            }
        }
    }

    fn begin_closing(&self) {
        let _ = self.closing.send_replace(true);
    }
}

/// A stream handle of an [`InMemoryEventStore`]
pub struct InMemoryEventStream {
    name: StreamName,
    state: Arc<StreamState>,
    lock: Arc<Mutex<()>>,
    subscriber_capacity: SubscriberCapacity,
    eviction: StreamEviction<InMemoryEventStream>,
}

impl InMemoryEventStream {
    /// Snapshot of every event appended to this generation of the stream
    pub fn events(&self) -> Vec<Event> {
        self.state.log.read().events.clone()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.state.log.read().subscribers.len()
    }

    async fn lock_live(&self) -> EventStoreResult<OwnedMutexGuard<()>> {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        self.ensure_live()?;
        Ok(guard)
    }

    fn ensure_live(&self) -> EventStoreResult<()> {
        if self.is_deleted() {
            Err(EventStoreError::deleted(&self.name))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for InMemoryEventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventStream")
            .field("name", &self.name)
            .field("deleted", &self.is_deleted())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventStream for InMemoryEventStream {
    fn name(&self) -> &StreamName {
        &self.name
    }

    fn is_deleted(&self) -> bool {
        self.state.deleted.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, events), fields(stream = %self.name, events = events.len()))]
    async fn append(&self, events: Vec<Event>) -> EventStoreResult<()> {
        let _guard = self.lock_live().await?;
        self.state.append(events).await;
        Ok(())
    }

    #[instrument(skip(self), fields(stream = %self.name))]
    async fn begin_transaction(&self) -> EventStoreResult<EventStreamTransaction> {
        let guard = self.lock_live().await?;
        Ok(EventStreamTransaction::new(
            self.name.clone(),
            Box::new(InMemoryCommit {
                _guard: guard,
                state: Arc::clone(&self.state),
            }),
        ))
    }

    #[instrument(skip(self), fields(stream = %self.name))]
    async fn delete(&self) -> EventStoreResult<()> {
        self.state.begin_closing();
        let _guard = self.lock_live().await?;
        {
            let mut log = self.state.log.write();
            self.state.deleted.store(true, Ordering::SeqCst);
            // Dropping the senders completes every subscription
            log.subscribers.clear();
        }
        self.eviction.evict_deleted(&self.name);
        debug!("stream deleted");
        Ok(())
    }

    fn enumerator(&self) -> EventStoreResult<EventStreamEnumerator> {
        self.ensure_live()?;
        Ok(EventStreamEnumerator::new(
            self.name.clone(),
            Box::new(InMemoryReader {
                state: Arc::clone(&self.state),
                position: 0,
            }),
        ))
    }

    async fn subscribe_catch_up(&self) -> EventStoreResult<CatchUpSubscription> {
        let (sender, receiver) = mpsc::channel(self.subscriber_capacity.into_inner());
        let history = {
            let mut log = self.state.log.write();
            if self.is_deleted() {
                return Err(EventStoreError::deleted(&self.name));
            }
            log.subscribers.push(sender);
            log.events.iter().cloned().collect::<VecDeque<_>>()
        };

        Ok(CatchUpSubscription::new(
            self.name.clone(),
            Box::new(InMemoryCatchUp {
                history,
                live: receiver,
            }),
        ))
    }

    #[instrument(skip(self, value), fields(stream = %self.name))]
    async fn set_metadata(&self, key: &str, value: MetadataValue) -> EventStoreResult<()> {
        ensure_key(key)?;
        let _guard = self.lock_live().await?;
        let _ = self
            .state
            .log
            .write()
            .metadata
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn try_get_metadata(&self, key: &str) -> EventStoreResult<Option<MetadataValue>> {
        ensure_key(key)?;
        self.ensure_live()?;
        Ok(self.state.log.read().metadata.get(key).cloned())
    }
}

fn ensure_key(key: &str) -> EventStoreResult<()> {
    if key.trim().is_empty() {
        Err(EventStoreError::ArgumentInvalid(
            "metadata key must not be empty".to_string(),
        ))
    } else {
        Ok(())
    }
}

struct InMemoryCommit {
    _guard: OwnedMutexGuard<()>,
    state: Arc<StreamState>,
}

#[async_trait]
impl TransactionCommit for InMemoryCommit {
    async fn commit(self: Box<Self>, events: Vec<Event>) -> EventStoreResult<()> {
        self.state.append(events).await;
        Ok(())
    }
}

/// Re-reads the live event vector on every step, so events appended while
/// enumerating are observed.
struct InMemoryReader {
    state: Arc<StreamState>,
    position: usize,
}

#[async_trait]
impl EventSource for InMemoryReader {
    async fn next_record(&mut self) -> EventStoreResult<Option<SourceItem>> {
        let event = self.state.log.read().events.get(self.position).cloned();
        if event.is_some() {
            self.position += 1;
        }
        Ok(event.map(Ok))
    }

    fn rewind(&mut self) {
        self.position = 0;
    }
}

struct InMemoryCatchUp {
    history: VecDeque<Event>,
    live: mpsc::Receiver<Event>,
}

#[async_trait]
impl EventSource for InMemoryCatchUp {
    async fn next_record(&mut self) -> EventStoreResult<Option<SourceItem>> {
        if let Some(event) = self.history.pop_front() {
            return Ok(Some(Ok(event)));
        }
        Ok(self.live.recv().await.map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitystore::resource::{ResourceType, ResourceTypeRegistry};

    struct Widget;

    fn widgets() -> ResourceType {
        ResourceTypeRegistry::new()
            .register::<Widget>("Widget", None)
            .unwrap()
    }

    fn name(raw: &str) -> StreamName {
        StreamName::try_new(raw).unwrap()
    }

    #[tokio::test]
    async fn handles_are_cached_per_name() {
        let store = InMemoryEventStore::new();

        let first = store.stream(&name("a")).await.unwrap();
        let second = store.stream(&name("a")).await.unwrap();
        let other = store.stream(&name("b")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn deletion_hands_out_a_fresh_generation() {
        // Given
        let store = InMemoryEventStore::new();
        let stream = store.stream(&name("a")).await.unwrap();
        stream.append(vec![Event::created(&widgets(), 1, "u")]).await.unwrap();

        // When
        stream.delete().await.unwrap();
        let fresh = store.stream(&name("a")).await.unwrap();

        // Then
        assert!(stream.is_deleted());
        assert!(!fresh.is_deleted());
        assert!(fresh.events().is_empty());
        assert!(matches!(
            stream.delete().await,
            Err(EventStoreError::StreamDeleted { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned_on_append() {
        let store = InMemoryEventStore::new();
        let stream = store.stream(&name("a")).await.unwrap();

        let subscription = stream.subscribe_catch_up().await.unwrap();
        assert_eq!(stream.subscriber_count(), 1);
        drop(subscription);

        stream.append(vec![Event::created(&widgets(), 1, "u")]).await.unwrap();

        assert_eq!(stream.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn enumerator_observes_events_appended_mid_scan() {
        let store = InMemoryEventStore::new();
        let stream = store.stream(&name("a")).await.unwrap();
        let resource_type = widgets();
        stream.append(vec![Event::created(&resource_type, 1, "u")]).await.unwrap();

        let mut enumerator = stream.enumerator().unwrap();
        assert!(enumerator.next().await.unwrap().is_some());
        assert!(enumerator.next().await.unwrap().is_none());

        stream.append(vec![Event::created(&resource_type, 2, "u")]).await.unwrap();

        let next = enumerator.next().await.unwrap().unwrap();
        assert_eq!(next.entity_id, 2);
    }
}
