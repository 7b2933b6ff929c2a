//! Transactions: a staged batch bound to one stream's writer lock.
//!
//! A transaction is created while holding the stream's lock and keeps holding
//! it until [`EventStreamTransaction::commit`] or drop. Committing consumes the
//! transaction, so it can happen at most once; dropping without committing
//! discards the staged events and releases the lock.

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::errors::EventStoreResult;
use crate::event::Event;
use crate::types::StreamName;

/// Backend hook that appends a committed batch.
///
/// Implementations own the stream's lock guard; it is released when the box is
/// dropped, whether or not `commit` ran.
#[async_trait]
pub trait TransactionCommit: Send {
    /// Appends `events` to the stream as one batch.
    async fn commit(self: Box<Self>, events: Vec<Event>) -> EventStoreResult<()>;
}

/// A batch of events staged for one stream.
pub struct EventStreamTransaction {
    stream: StreamName,
    staged: Vec<Event>,
    committer: Option<Box<dyn TransactionCommit>>,
}

impl EventStreamTransaction {
    /// Starts a transaction that commits through `committer`.
    pub fn new(stream: StreamName, committer: Box<dyn TransactionCommit>) -> Self {
        Self {
            stream,
            staged: Vec::new(),
            committer: Some(committer),
        }
    }

    /// Name of the stream the transaction writes to.
    pub fn stream_name(&self) -> &StreamName {
        &self.stream
    }

    /// Stages one event.
    pub fn append(&mut self, event: Event) {
        self.staged.push(event);
    }

    /// Stages several events, preserving their order.
    pub fn append_many(&mut self, events: impl IntoIterator<Item = Event>) {
        self.staged.extend(events);
    }

    /// The events staged so far.
    pub fn staged(&self) -> &[Event] {
        &self.staged
    }

    /// Appends the staged batch (possibly empty) and releases the lock.
    #[instrument(skip(self), fields(stream = %self.stream, events = self.staged.len()))]
    pub async fn commit(mut self) -> EventStoreResult<()> {
        let events = std::mem::take(&mut self.staged);
        match self.committer.take() {
            Some(committer) => committer.commit(events).await,
            None => Ok(()),
        }
    }
}

impl Drop for EventStreamTransaction {
    fn drop(&mut self) {
        if self.committer.is_some() {
            debug!(
                stream = %self.stream,
                discarded = self.staged.len(),
                "transaction dropped without commit"
            );
        }
    }
}

impl fmt::Debug for EventStreamTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStreamTransaction")
            .field("stream", &self.stream)
            .field("staged", &self.staged.len())
            .field("committed", &self.committer.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceTypeRegistry;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Widget;

    struct RecordingCommit {
        log: Arc<Mutex<Vec<Event>>>,
    }

    #[async_trait]
    impl TransactionCommit for RecordingCommit {
        async fn commit(self: Box<Self>, events: Vec<Event>) -> EventStoreResult<()> {
            self.log.lock().extend(events);
            Ok(())
        }
    }

    fn transaction(log: &Arc<Mutex<Vec<Event>>>) -> EventStreamTransaction {
        EventStreamTransaction::new(
            StreamName::try_new("tx").unwrap(),
            Box::new(RecordingCommit {
                log: Arc::clone(log),
            }),
        )
    }

    #[tokio::test]
    async fn commit_appends_staged_events_in_order() {
        let registry = ResourceTypeRegistry::new();
        let widget = registry.register::<Widget>("Widget", None).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut tx = transaction(&log);
        tx.append(Event::created(&widget, 1, "u"));
        tx.append_many([Event::deleted(&widget, 1, "u"), Event::created(&widget, 2, "u")]);
        assert_eq!(tx.staged().len(), 3);
        assert!(log.lock().is_empty());

        tx.commit().await.unwrap();

        let committed: Vec<_> = log.lock().iter().map(|e| (e.entity_id, e.kind_name())).collect();
        assert_eq!(committed, vec![(1, "Created"), (1, "Deleted"), (2, "Created")]);
    }

    #[test]
    fn dropping_discards_the_batch() {
        let registry = ResourceTypeRegistry::new();
        let widget = registry.register::<Widget>("Widget", None).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        {
            let mut tx = transaction(&log);
            tx.append(Event::created(&widget, 1, "u"));
        }

        assert!(log.lock().is_empty());
    }
}
