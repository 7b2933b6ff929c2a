use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use entitystore::config::SubscriberCapacity;
use entitystore::envelope::RawRecord;
use entitystore::errors::{EventStoreError, EventStoreResult};
use entitystore::log::{LiveFeed, LogConnection, RecordedEvent, StreamMetadata, StreamSlice};
use entitystore::types::StreamName;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

type Streams = Arc<RwLock<HashMap<StreamName, LogStream>>>;

/// Where a stream's log currently ends, and how often it was soft-deleted.
#[derive(Debug, Clone, Copy, Default)]
struct StreamHead {
    next_event_number: u64,
    deletions: u64,
}

struct LogStream {
    // Indexed by event number; entries below `truncate_before` are soft-deleted
    records: Vec<RawRecord>,
    truncate_before: u64,
    metadata: StreamMetadata,
    head: watch::Sender<StreamHead>,
}

impl Default for LogStream {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            truncate_before: 0,
            metadata: StreamMetadata::new(),
            head: watch::channel(StreamHead::default()).0,
        }
    }
}

impl LogStream {
    fn next_event_number(&self) -> u64 {
        self.records.len() as u64
    }

    fn records_from(&self, start: u64) -> Vec<RecordedEvent> {
        let first = usize::try_from(start).map_or(self.records.len(), |start| {
            start.min(self.records.len())
        });
        self.records[first..]
            .iter()
            .zip(start..)
            .map(|(record, event_number)| RecordedEvent {
                event_number,
                record: record.clone(),
            })
            .collect()
    }

    fn slice(&self, start: u64, count: usize) -> StreamSlice {
        if start < self.truncate_before {
            return StreamSlice {
                records: Vec::new(),
                next_event_number: self.truncate_before,
                is_end_of_stream: false,
            };
        }

        let len = self.records.len();
        let first = usize::try_from(start).map_or(len, |start| start.min(len));
        let last = first.saturating_add(count).min(len);
        let records = self.records[first..last]
            .iter()
            .zip(start..)
            .map(|(record, event_number)| RecordedEvent {
                event_number,
                record: record.clone(),
            })
            .collect();

        StreamSlice {
            records,
            next_event_number: last as u64,
            is_end_of_stream: last >= len,
        }
    }
}

/// Feeds one live subscription from the server-side log.
///
/// The log itself is the backlog: a subscriber that stops reading only parks
/// its own feed, never the writers. The feed ends when the stream is
/// soft-deleted or the receiver is dropped.
async fn forward_live(
    streams: Streams,
    stream: StreamName,
    mut next: u64,
    generation: u64,
    mut head: watch::Receiver<StreamHead>,
    sender: mpsc::Sender<RecordedEvent>,
) {
    let deleted = |current: &StreamHead| current.deletions != generation;

    loop {
        if deleted(&*head.borrow_and_update()) {
            return;
        }

        let pending = streams
            .read()
            .get(&stream)
            .map(|log| log.records_from(next))
            .unwrap_or_default();
        for recorded in pending {
            let event_number = recorded.event_number;
            tokio::select! {
                sent = sender.send(recorded) => {
                    if sent.is_err() {
                        return;
                    }
                    next = event_number + 1;
                }
                () = async {
                    let _ = head.wait_for(deleted).await;
                } => return,
            }
        }

        tokio::select! {
            changed = head.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            () = sender.closed() => return,
        }
    }
}

/// In-process emulation of the log server's wire contract.
///
/// Streams keep their event numbers across soft deletion: a read starting
/// inside the deleted range answers with an empty page pointing past it.
/// Live feeds are served from the stored log by a task per subscription, so
/// appends never wait on subscribers. Tests can inject raw records and
/// simulate a failing server.
pub struct InMemoryLogConnection {
    streams: Streams,
    failure: Mutex<Option<String>>,
    reads: AtomicUsize,
    subscriber_capacity: SubscriberCapacity,
}

impl InMemoryLogConnection {
    /// Creates a server with no streams.
    pub fn new() -> Self {
        Self::with_subscriber_capacity(SubscriberCapacity::default())
    }

    /// Creates a server whose live feeds buffer at most `capacity` records.
    pub fn with_subscriber_capacity(capacity: SubscriberCapacity) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            failure: Mutex::new(None),
            reads: AtomicUsize::new(0),
            subscriber_capacity: capacity,
        }
    }

    /// Appends a record verbatim, bypassing the envelope encoder.
    pub fn inject_raw(&self, stream: &StreamName, record: RawRecord) {
        self.write_records(stream, vec![record]);
    }

    /// While `Some`, every append fails with a backend error carrying the message.
    pub fn fail_appends(&self, message: Option<String>) {
        *self.failure.lock() = message;
    }

    /// Number of forward reads served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Every record ever appended to `stream`, including soft-deleted ones.
    pub fn raw_records(&self, stream: &StreamName) -> Vec<RawRecord> {
        self.streams
            .read()
            .get(stream)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    fn write_records(&self, stream: &StreamName, records: Vec<RawRecord>) {
        if records.is_empty() {
            return;
        }

        let count = records.len();
        let mut streams = self.streams.write();
        let log = streams.entry(stream.clone()).or_default();
        log.records.extend(records);
        let next_event_number = log.next_event_number();
        log.head
            .send_modify(|head| head.next_event_number = next_event_number);
        trace!(stream = %stream, records = count, "appended records");
    }
}

impl Default for InMemoryLogConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryLogConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLogConnection")
            .field("streams", &self.streams.read().len())
            .field("reads", &self.read_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LogConnection for InMemoryLogConnection {
    async fn append_to_stream(
        &self,
        stream: &StreamName,
        records: Vec<RawRecord>,
    ) -> EventStoreResult<()> {
        let failure = self.failure.lock().clone();
        if let Some(message) = failure {
            return Err(EventStoreError::Backend(message));
        }
        self.write_records(stream, records);
        Ok(())
    }

    async fn read_stream_forward(
        &self,
        stream: &StreamName,
        start: u64,
        count: usize,
    ) -> EventStoreResult<StreamSlice> {
        let _ = self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.streams.read().get(stream).map_or_else(
            || StreamSlice {
                records: Vec::new(),
                next_event_number: 0,
                is_end_of_stream: true,
            },
            |log| log.slice(start, count),
        ))
    }

    async fn get_stream_metadata(&self, stream: &StreamName) -> EventStoreResult<StreamMetadata> {
        Ok(self
            .streams
            .read()
            .get(stream)
            .map(|log| log.metadata.clone())
            .unwrap_or_default())
    }

    async fn set_stream_metadata(
        &self,
        stream: &StreamName,
        metadata: StreamMetadata,
    ) -> EventStoreResult<()> {
        self.streams
            .write()
            .entry(stream.clone())
            .or_default()
            .metadata = metadata;
        Ok(())
    }

    async fn delete_stream(&self, stream: &StreamName) -> EventStoreResult<()> {
        let mut streams = self.streams.write();
        let log = streams.entry(stream.clone()).or_default();
        log.truncate_before = log.next_event_number();
        log.metadata.clear();
        log.head.send_modify(|head| head.deletions += 1);
        debug!(stream = %stream, truncate_before = log.truncate_before, "soft-deleted stream");
        Ok(())
    }

    async fn subscribe_to_stream(&self, stream: &StreamName) -> EventStoreResult<LiveFeed> {
        let (sender, receiver) = mpsc::channel(self.subscriber_capacity.into_inner());
        let (start, generation, head) = {
            let mut streams = self.streams.write();
            let log = streams.entry(stream.clone()).or_default();
            let generation = log.head.borrow().deletions;
            (log.next_event_number(), generation, log.head.subscribe())
        };

        tokio::spawn(forward_live(
            Arc::clone(&self.streams),
            stream.clone(),
            start,
            generation,
            head,
            sender,
        ));
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(n: u8) -> RawRecord {
        RawRecord {
            event_id: Uuid::now_v7(),
            event_type: "test".to_string(),
            data: vec![n],
            metadata: Vec::new(),
        }
    }

    fn name() -> StreamName {
        StreamName::try_new("log").unwrap()
    }

    #[tokio::test]
    async fn missing_streams_read_as_empty() {
        let connection = InMemoryLogConnection::new();

        let slice = connection.read_stream_forward(&name(), 0, 10).await.unwrap();

        assert!(slice.records.is_empty());
        assert_eq!(slice.next_event_number, 0);
        assert!(slice.is_end_of_stream);
    }

    #[tokio::test]
    async fn reads_are_paged() {
        let connection = InMemoryLogConnection::new();
        connection
            .append_to_stream(&name(), (0..5).map(record).collect())
            .await
            .unwrap();

        let first = connection.read_stream_forward(&name(), 0, 3).await.unwrap();
        let second = connection
            .read_stream_forward(&name(), first.next_event_number, 3)
            .await
            .unwrap();

        assert_eq!(first.records.len(), 3);
        assert!(!first.is_end_of_stream);
        assert_eq!(second.records.len(), 2);
        assert_eq!(second.records[0].event_number, 3);
        assert!(second.is_end_of_stream);
        assert_eq!(connection.read_count(), 2);
    }

    #[tokio::test]
    async fn soft_deleted_prefix_answers_with_an_empty_page() {
        // Given
        let connection = InMemoryLogConnection::new();
        connection
            .append_to_stream(&name(), vec![record(0), record(1)])
            .await
            .unwrap();
        connection.delete_stream(&name()).await.unwrap();
        connection
            .append_to_stream(&name(), vec![record(2)])
            .await
            .unwrap();

        // When
        let first = connection.read_stream_forward(&name(), 0, 10).await.unwrap();
        let second = connection
            .read_stream_forward(&name(), first.next_event_number, 10)
            .await
            .unwrap();

        // Then
        assert!(first.records.is_empty());
        assert_eq!(first.next_event_number, 2);
        assert!(!first.is_end_of_stream);
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].event_number, 2);
        assert_eq!(second.records[0].record.data, vec![2]);
    }

    #[tokio::test]
    async fn deletion_closes_live_feeds_and_clears_metadata() {
        let connection = InMemoryLogConnection::new();
        let mut feed = connection.subscribe_to_stream(&name()).await.unwrap();
        let mut metadata = StreamMetadata::new();
        let _ = metadata.insert("StreamVersion".to_string(), 2.into());
        connection.set_stream_metadata(&name(), metadata).await.unwrap();

        connection.delete_stream(&name()).await.unwrap();

        assert!(feed.recv().await.is_none());
        assert!(connection
            .get_stream_metadata(&name())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn injected_failures_reject_appends() {
        let connection = InMemoryLogConnection::new();
        connection.fail_appends(Some("server unavailable".to_string()));

        let result = connection.append_to_stream(&name(), vec![record(0)]).await;

        assert_eq!(
            result,
            Err(EventStoreError::Backend("server unavailable".to_string()))
        );
        assert!(connection.raw_records(&name()).is_empty());

        connection.fail_appends(None);
        connection
            .append_to_stream(&name(), vec![record(0)])
            .await
            .unwrap();
        assert_eq!(connection.raw_records(&name()).len(), 1);
    }
}
