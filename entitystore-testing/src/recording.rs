//! A domain index that records events for assertions.
//!
//! # Example
//!
//! ```ignore
//! let recorder = Arc::new(RecordingIndex::new());
//! let cache = InMemoryCache::new().with_shared_index(recorder.clone());
//!
//! let service = EventStoreService::start(store, config, &catalog, registry, cache).await?;
//!
//! assert_eq!(recorder.events().len(), expected_count);
//! ```

use std::any::Any;

use entitystore::errors::IndexError;
use entitystore::event::Event;
use entitystore::index::DomainIndex;
use parking_lot::Mutex;

/// Remembers every event it is fed, in order.
///
/// Can be told to reject events so tests can check that a failing index does
/// not stop the others.
#[derive(Debug, Default)]
pub struct RecordingIndex {
    events: Mutex<Vec<Event>>,
    reject_with: Option<String>,
}

impl RecordingIndex {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recorder that fails every event with `reason` after recording it.
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            reject_with: Some(reason.into()),
        }
    }

    /// Returns a clone of all recorded events.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl DomainIndex for RecordingIndex {
    fn apply_event(&self, event: &Event) -> Result<(), IndexError> {
        self.events.lock().push(event.clone());
        match &self.reject_with {
            Some(reason) => Err(IndexError::Rejected(reason.clone())),
            None => Ok(()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
