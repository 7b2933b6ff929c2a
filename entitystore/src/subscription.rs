//! Readers over an event stream: the historical enumerator and the catch-up
//! subscription.
//!
//! Both wrap a backend-specific [`EventSource`] that yields either a decoded
//! event or an [`EventParseFailure`]. Parse failures never reach the caller as
//! errors: they are handed to the installed handler, or logged as a warning,
//! and the record is skipped.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::errors::{EventParseFailure, EventStoreResult};
use crate::event::Event;
use crate::types::StreamName;

/// Callback invoked for every record that could not be decoded.
pub type ParseFailureHandler = Arc<dyn Fn(&EventParseFailure) + Send + Sync>;

/// One item produced by an [`EventSource`].
pub type SourceItem = Result<Event, EventParseFailure>;

/// Backend-specific producer of stream records.
#[async_trait]
pub trait EventSource: Send {
    /// The next record, or `None` once the source is exhausted.
    async fn next_record(&mut self) -> EventStoreResult<Option<SourceItem>>;

    /// Moves back to the beginning of the stream.
    fn rewind(&mut self) {}
}

fn report_parse_failure(handler: Option<&ParseFailureHandler>, failure: &EventParseFailure) {
    match handler {
        Some(handler) => handler(failure),
        None => warn!(
            stream = %failure.stream,
            event_number = failure.event_number,
            error = %failure.source,
            "skipping event that could not be parsed"
        ),
    }
}

/// Sequential reader over the historical events of a stream.
///
/// Each enumerator is an independent cursor starting at the beginning of the
/// stream. It is not a frozen snapshot: whether events appended mid-scan are
/// observed depends on the backend.
pub struct EventStreamEnumerator {
    stream: StreamName,
    source: Box<dyn EventSource>,
    on_parse_failure: Option<ParseFailureHandler>,
}

impl EventStreamEnumerator {
    /// Wraps a backend source.
    pub fn new(stream: StreamName, source: Box<dyn EventSource>) -> Self {
        Self {
            stream,
            source,
            on_parse_failure: None,
        }
    }

    /// Name of the stream being read.
    pub fn stream_name(&self) -> &StreamName {
        &self.stream
    }

    /// Installs the handler receiving parse failures.
    pub fn on_parse_failure(&mut self, handler: ParseFailureHandler) {
        self.on_parse_failure = Some(handler);
    }

    /// Advances to the next event.
    pub async fn next(&mut self) -> EventStoreResult<Option<Event>> {
        while let Some(item) = self.source.next_record().await? {
            match item {
                Ok(event) => return Ok(Some(event)),
                Err(failure) => report_parse_failure(self.on_parse_failure.as_ref(), &failure),
            }
        }
        Ok(None)
    }

    /// Restarts from the beginning of the stream.
    pub fn reset(&mut self) {
        self.source.rewind();
    }

    /// Reads every remaining event.
    pub async fn read_to_end(&mut self) -> EventStoreResult<Vec<Event>> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await? {
            events.push(event);
        }
        Ok(events)
    }
}

impl fmt::Debug for EventStreamEnumerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStreamEnumerator")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

/// Feed of every historical event followed, without gap or duplicate, by every
/// event appended after the subscription started.
///
/// `next` returns `None` once the stream is deleted. Dropping the subscription
/// disposes it.
pub struct CatchUpSubscription {
    stream: StreamName,
    source: Box<dyn EventSource>,
    on_parse_failure: Option<ParseFailureHandler>,
}

impl CatchUpSubscription {
    /// Wraps a backend source.
    pub fn new(stream: StreamName, source: Box<dyn EventSource>) -> Self {
        Self {
            stream,
            source,
            on_parse_failure: None,
        }
    }

    /// Name of the stream being followed.
    pub fn stream_name(&self) -> &StreamName {
        &self.stream
    }

    /// Installs the handler receiving parse failures.
    pub fn on_parse_failure(&mut self, handler: ParseFailureHandler) {
        self.on_parse_failure = Some(handler);
    }

    /// Waits for the next event. `None` means the feed completed.
    pub async fn next(&mut self) -> EventStoreResult<Option<Event>> {
        while let Some(item) = self.source.next_record().await? {
            match item {
                Ok(event) => return Ok(Some(event)),
                Err(failure) => report_parse_failure(self.on_parse_failure.as_ref(), &failure),
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for CatchUpSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatchUpSubscription")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}
