//! Event streams backed by a networked append-only log server.
//!
//! The server is reached through a [`LogConnection`], which models its wire
//! contract: batched appends, paginated forward reads reporting a next-offset
//! cursor and end-of-stream, a per-stream metadata bag, soft deletion and live
//! subscriptions. Events travel as [`RawRecord`]s in the format defined by
//! [`crate::envelope`].
//!
//! Historical reads are paged at [`PAGE_SIZE`]. A soft-deleted stream may
//! answer the first read with an empty page and a non-zero next offset; the
//! reader keeps fetching until it finds records or the end of the stream.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::envelope::{self, RawRecord};
use crate::errors::{EventParseFailure, EventStoreError, EventStoreResult};
use crate::event::Event;
use crate::stream::{
    EventStore, EventStream, MetadataValue, StreamEviction, StreamHandleCache,
};
use crate::subscription::{CatchUpSubscription, EventSource, EventStreamEnumerator, SourceItem};
use crate::transaction::{EventStreamTransaction, TransactionCommit};
use crate::types::StreamName;

/// Number of events requested per historical read.
pub const PAGE_SIZE: usize = 4096;

/// A record together with its position in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Position of the record in the stream. Positions keep increasing across
    /// soft deletions.
    pub event_number: u64,
    /// The stored record.
    pub record: RawRecord,
}

/// One page of a forward read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSlice {
    /// Records in stream order.
    pub records: Vec<RecordedEvent>,
    /// Where the next read should start.
    pub next_event_number: u64,
    /// Whether no records exist beyond this page.
    pub is_end_of_stream: bool,
}

/// Live records appended after a subscription was opened. The channel closes
/// when the stream is deleted.
pub type LiveFeed = mpsc::Receiver<RecordedEvent>;

/// The metadata bag of a stream as stored on the server.
pub type StreamMetadata = BTreeMap<String, serde_json::Value>;

/// Wire contract of the log server.
#[async_trait]
pub trait LogConnection: Send + Sync + 'static {
    /// Appends `records` as one batch. Must not wait on live subscribers:
    /// a feed that stops reading may not hold up writers.
    async fn append_to_stream(
        &self,
        stream: &StreamName,
        records: Vec<RawRecord>,
    ) -> EventStoreResult<()>;

    /// Reads up to `count` records starting at `start`.
    async fn read_stream_forward(
        &self,
        stream: &StreamName,
        start: u64,
        count: usize,
    ) -> EventStoreResult<StreamSlice>;

    /// Reads the metadata bag.
    async fn get_stream_metadata(&self, stream: &StreamName) -> EventStoreResult<StreamMetadata>;

    /// Replaces the metadata bag.
    async fn set_stream_metadata(
        &self,
        stream: &StreamName,
        metadata: StreamMetadata,
    ) -> EventStoreResult<()>;

    /// Soft-deletes the stream. Later appends start a new generation.
    async fn delete_stream(&self, stream: &StreamName) -> EventStoreResult<()>;

    /// Opens a live subscription delivering records appended from now on.
    async fn subscribe_to_stream(&self, stream: &StreamName) -> EventStoreResult<LiveFeed>;
}

/// [`EventStore`] over a [`LogConnection`].
pub struct LogEventStore<C: LogConnection> {
    connection: Arc<C>,
    handles: StreamHandleCache<LogEventStream<C>>,
}

impl<C: LogConnection> LogEventStore<C> {
    /// Creates a store using `connection`.
    pub fn new(connection: C) -> Self {
        Self::with_shared_connection(Arc::new(connection))
    }

    /// Creates a store sharing an existing connection.
    pub fn with_shared_connection(connection: Arc<C>) -> Self {
        Self {
            connection,
            handles: StreamHandleCache::new(),
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }
}

impl<C: LogConnection> fmt::Debug for LogEventStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEventStore")
            .field("cached_streams", &self.handles.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: LogConnection> EventStore for LogEventStore<C> {
    type Stream = LogEventStream<C>;

    async fn stream(&self, name: &StreamName) -> EventStoreResult<Arc<Self::Stream>> {
        Ok(self.handles.get_or_insert_with(name, |eviction| LogEventStream {
            name: name.clone(),
            connection: Arc::clone(&self.connection),
            lock: Arc::new(Mutex::new(())),
            deleted: AtomicBool::new(false),
            eviction,
        }))
    }
}

/// A stream handle of a [`LogEventStore`].
pub struct LogEventStream<C: LogConnection> {
    name: StreamName,
    connection: Arc<C>,
    lock: Arc<Mutex<()>>,
    deleted: AtomicBool,
    eviction: StreamEviction<LogEventStream<C>>,
}

impl<C: LogConnection> LogEventStream<C> {
    async fn lock_live(&self) -> EventStoreResult<OwnedMutexGuard<()>> {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        self.ensure_live()?;
        Ok(guard)
    }

    fn ensure_live(&self) -> EventStoreResult<()> {
        if self.deleted.load(Ordering::SeqCst) {
            Err(EventStoreError::deleted(&self.name))
        } else {
            Ok(())
        }
    }

    fn reader(&self) -> PagedReader<C> {
        PagedReader::new(Arc::clone(&self.connection), self.name.clone())
    }
}

impl<C: LogConnection> fmt::Debug for LogEventStream<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEventStream")
            .field("name", &self.name)
            .field("deleted", &self.deleted.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn encode_all(events: &[Event]) -> EventStoreResult<Vec<RawRecord>> {
    events.iter().map(envelope::encode).collect()
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

#[async_trait]
impl<C: LogConnection> EventStream for LogEventStream<C> {
    fn name(&self) -> &StreamName {
        &self.name
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, events), fields(stream = %self.name, events = events.len()))]
    async fn append(&self, events: Vec<Event>) -> EventStoreResult<()> {
        let _guard = self.lock_live().await?;
        let records = encode_all(&events)?;
        self.connection.append_to_stream(&self.name, records).await
    }

    #[instrument(skip(self), fields(stream = %self.name))]
    async fn begin_transaction(&self) -> EventStoreResult<EventStreamTransaction> {
        let guard = self.lock_live().await?;
        Ok(EventStreamTransaction::new(
            self.name.clone(),
            Box::new(LogCommit {
                _guard: guard,
                connection: Arc::clone(&self.connection),
                stream: self.name.clone(),
            }),
        ))
    }

    #[instrument(skip(self), fields(stream = %self.name))]
    async fn delete(&self) -> EventStoreResult<()> {
        let _guard = self.lock_live().await?;
        self.connection.delete_stream(&self.name).await?;
        self.deleted.store(true, Ordering::SeqCst);
        self.eviction.evict_deleted(&self.name);
        debug!("stream deleted");
        Ok(())
    }

    fn enumerator(&self) -> EventStoreResult<EventStreamEnumerator> {
        self.ensure_live()?;
        Ok(EventStreamEnumerator::new(
            self.name.clone(),
            Box::new(self.reader()),
        ))
    }

    async fn subscribe_catch_up(&self) -> EventStoreResult<CatchUpSubscription> {
        self.ensure_live()?;
        // Live first, so nothing appended while history is read can be missed
        let live = self.connection.subscribe_to_stream(&self.name).await?;
        Ok(CatchUpSubscription::new(
            self.name.clone(),
            Box::new(CatchUpReader {
                history: self.reader(),
                history_done: false,
                live,
                last_delivered: None,
            }),
        ))
    }

    #[instrument(skip(self, value), fields(stream = %self.name))]
    async fn set_metadata(&self, key: &str, value: MetadataValue) -> EventStoreResult<()> {
        ensure_key(key)?;
        let _guard = self.lock_live().await?;
        let mut metadata = self.connection.get_stream_metadata(&self.name).await?;
        let _ = metadata.insert(key.to_string(), value.to_json());
        self.connection
            .set_stream_metadata(&self.name, metadata)
            .await
    }

    async fn try_get_metadata(&self, key: &str) -> EventStoreResult<Option<MetadataValue>> {
        ensure_key(key)?;
        self.ensure_live()?;
        let mut metadata = self.connection.get_stream_metadata(&self.name).await?;
        metadata
            .remove(key)
            .map(|value| MetadataValue::from_json(key, value))
            .transpose()
    }
}

struct LogCommit<C> {
    _guard: OwnedMutexGuard<()>,
    connection: Arc<C>,
    stream: StreamName,
}

#[async_trait]
impl<C: LogConnection> TransactionCommit for LogCommit<C> {
    async fn commit(self: Box<Self>, events: Vec<Event>) -> EventStoreResult<()> {
        let records = encode_all(&events)?;
        self.connection.append_to_stream(&self.stream, records).await
    }
}

fn decode_recorded(stream: &StreamName, recorded: RecordedEvent) -> SourceItem {
    envelope::decode(&recorded.record).map_err(|source| EventParseFailure {
        stream: stream.clone(),
        event_number: recorded.event_number,
        record: recorded.record,
        source,
    })
}

/// Forward reader fetching [`PAGE_SIZE`] records at a time.
struct PagedReader<C> {
    connection: Arc<C>,
    stream: StreamName,
    next_event_number: u64,
    buffer: VecDeque<RecordedEvent>,
    end_of_stream: bool,
}

impl<C: LogConnection> PagedReader<C> {
    fn new(connection: Arc<C>, stream: StreamName) -> Self {
        Self {
            connection,
            stream,
            next_event_number: 0,
            buffer: VecDeque::new(),
            end_of_stream: false,
        }
    }

    async fn next_recorded(&mut self) -> EventStoreResult<Option<RecordedEvent>> {
        loop {
            if let Some(recorded) = self.buffer.pop_front() {
                return Ok(Some(recorded));
            }
            if self.end_of_stream {
                return Ok(None);
            }

            let start = self.next_event_number;
            let slice = self
                .connection
                .read_stream_forward(&self.stream, start, PAGE_SIZE)
                .await?;

            // An empty page that does not move the cursor would loop forever
            let stalled = slice.records.is_empty() && slice.next_event_number <= start;
            self.next_event_number = slice.next_event_number;
            self.end_of_stream = slice.is_end_of_stream || stalled;
            self.buffer.extend(slice.records);
        }
    }
}

#[async_trait]
impl<C: LogConnection> EventSource for PagedReader<C> {
    async fn next_record(&mut self) -> EventStoreResult<Option<SourceItem>> {
        Ok(self
            .next_recorded()
            .await?
            .map(|recorded| decode_recorded(&self.stream, recorded)))
    }

    fn rewind(&mut self) {
        self.next_event_number = 0;
        self.buffer.clear();
        self.end_of_stream = false;
    }
}

/// History through the paged reader, then the live feed with anything
/// already delivered skipped.
struct CatchUpReader<C> {
    history: PagedReader<C>,
    history_done: bool,
    live: LiveFeed,
    last_delivered: Option<u64>,
}

#[async_trait]
impl<C: LogConnection> EventSource for CatchUpReader<C> {
    async fn next_record(&mut self) -> EventStoreResult<Option<SourceItem>> {
        if !self.history_done {
            if let Some(recorded) = self.history.next_recorded().await? {
                self.last_delivered = Some(recorded.event_number);
                return Ok(Some(decode_recorded(&self.history.stream, recorded)));
            }
            self.history_done = true;
        }

        while let Some(recorded) = self.live.recv().await {
            if self
                .last_delivered
                .is_some_and(|last| recorded.event_number <= last)
            {
                continue;
            }
            self.last_delivered = Some(recorded.event_number);
            return Ok(Some(decode_recorded(&self.history.stream, recorded)));
        }

        Ok(None)
    }
}
