//! Event streams and the stores that hand them out.
//!
//! An [`EventStream`] is a named, append-only sequence of events with a small
//! typed metadata bag. Each stream handle owns one asynchronous writer lock
//! that serializes `append`, `begin_transaction`, `delete` and
//! `set_metadata`; the deleted flag is checked under that lock before any I/O.
//!
//! Deletion is terminal for a handle. The owning [`EventStore`] drops the
//! deleted handle from its cache, so the next call to [`EventStore::stream`]
//! returns a fresh handle representing a new generation of the stream.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{EventStoreError, EventStoreResult};
use crate::event::Event;
use crate::subscription::{CatchUpSubscription, EventStreamEnumerator};
use crate::transaction::EventStreamTransaction;
use crate::types::StreamName;

/// Metadata key holding the migration version of a stream.
pub const STREAM_VERSION_METADATA_KEY: &str = "StreamVersion";

/// A value stored in a stream's metadata bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A boolean.
    Bool(bool),
    /// A string.
    Text(String),
}

impl MetadataValue {
    /// The value as an integer, if it is one.
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// The value as a float. Integers are widened.
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    /// The value as a boolean, if it is one.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// The value as a string slice, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Converts a JSON value read from a backend.
    pub fn from_json(key: &str, value: serde_json::Value) -> EventStoreResult<Self> {
        serde_json::from_value(value).map_err(|_| EventStoreError::UnsupportedMetadata {
            key: key.to_string(),
        })
    }

    /// Converts the value to JSON for a backend.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(value) => (*value).into(),
            Self::Float(value) => (*value).into(),
            Self::Bool(value) => (*value).into(),
            Self::Text(value) => value.clone().into(),
        }
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for MetadataValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for MetadataValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// A named, append-only, lockable sequence of events.
#[async_trait]
pub trait EventStream: Send + Sync + 'static {
    /// Name of the stream.
    fn name(&self) -> &StreamName;

    /// Whether this handle has been deleted.
    fn is_deleted(&self) -> bool;

    /// Appends `events` at the tail as one indivisible batch, then notifies
    /// subscribers of each event in order.
    async fn append(&self, events: Vec<Event>) -> EventStoreResult<()>;

    /// Appends a single event.
    async fn append_one(&self, event: Event) -> EventStoreResult<()> {
        self.append(vec![event]).await
    }

    /// Acquires the writer lock and returns a transaction holding it until
    /// commit or drop.
    async fn begin_transaction(&self) -> EventStoreResult<EventStreamTransaction>;

    /// Marks the handle deleted, completes all subscriptions and removes the
    /// persisted log. Deleting twice fails with `StreamDeleted`.
    async fn delete(&self) -> EventStoreResult<()>;

    /// A fresh cursor over the historical events, from the beginning.
    fn enumerator(&self) -> EventStoreResult<EventStreamEnumerator>;

    /// A feed of every historical event followed by every event appended later.
    async fn subscribe_catch_up(&self) -> EventStoreResult<CatchUpSubscription>;

    /// Stores `value` under `key`.
    async fn set_metadata(&self, key: &str, value: MetadataValue) -> EventStoreResult<()>;

    /// Reads the value stored under `key`.
    async fn try_get_metadata(&self, key: &str) -> EventStoreResult<Option<MetadataValue>>;
}

/// Hands out stream handles by name.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// The stream handle type of this backend.
    type Stream: EventStream;

    /// Returns the cached handle for `name`, creating one if none is cached.
    async fn stream(&self, name: &StreamName) -> EventStoreResult<Arc<Self::Stream>>;
}

type HandleMap<S> = Mutex<HashMap<StreamName, Arc<S>>>;

/// Per-name cache of stream handles shared by a store and its streams.
#[derive(Debug)]
pub struct StreamHandleCache<S> {
    handles: Arc<HandleMap<S>>,
}

impl<S> Default for StreamHandleCache<S> {
    fn default() -> Self {
        Self {
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<S> Clone for StreamHandleCache<S> {
    fn clone(&self) -> Self {
        Self {
            handles: Arc::clone(&self.handles),
        }
    }
}

impl<S: EventStream> StreamHandleCache<S> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached handle for `name`, or caches the one built by `create`.
    pub fn get_or_insert_with(
        &self,
        name: &StreamName,
        create: impl FnOnce(StreamEviction<S>) -> S,
    ) -> Arc<S> {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(name) {
            if !handle.is_deleted() {
                return Arc::clone(handle);
            }
        }

        let handle = Arc::new(create(StreamEviction {
            handles: Arc::downgrade(&self.handles),
        }));
        handles.insert(name.clone(), Arc::clone(&handle));
        handle
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Whether no handle is cached.
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

/// Lets a stream drop itself from its store's cache once deleted.
#[derive(Debug)]
pub struct StreamEviction<S> {
    handles: Weak<HandleMap<S>>,
}

impl<S: EventStream> StreamEviction<S> {
    /// Removes the cached handle for `name` if it is deleted.
    pub fn evict_deleted(&self, name: &StreamName) {
        let Some(handles) = self.handles.upgrade() else {
            return;
        };
        let mut handles = handles.lock();
        if handles.get(name).is_some_and(|handle| handle.is_deleted()) {
            let _ = handles.remove(name);
            debug!(stream = %name, "evicted deleted stream handle");
        }
    }
}
