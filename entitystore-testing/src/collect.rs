use std::time::Duration;

use entitystore::errors::EventStoreError;
use entitystore::event::Event;
use entitystore::subscription::CatchUpSubscription;

/// Error returned when collecting events from a subscription fails.
#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    /// Timeout expired before collecting the expected number of events.
    #[error("timeout waiting for {expected} events, received {received}")]
    Timeout {
        /// Number of events requested.
        expected: usize,
        /// Number of events received before the timeout.
        received: usize,
    },

    /// The subscription completed before delivering the expected number of events.
    #[error("subscription ended after {received} of {expected} events")]
    Ended {
        /// Number of events requested.
        expected: usize,
        /// Number of events received before completion.
        received: usize,
    },

    /// The subscription was still open when the timeout expired.
    #[error("subscription still open after {received} events")]
    StillOpen {
        /// Number of events received before the timeout.
        received: usize,
    },

    /// The backend failed while reading.
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// Receives exactly `count` events from `subscription`, giving up after `timeout`.
pub async fn collect_events(
    subscription: &mut CatchUpSubscription,
    count: usize,
    timeout: Duration,
) -> Result<Vec<Event>, CollectionError> {
    let mut events = Vec::with_capacity(count);
    let outcome = tokio::time::timeout(timeout, async {
        while events.len() < count {
            match subscription.next().await? {
                Some(event) => events.push(event),
                None => return Ok(false),
            }
        }
        Ok::<_, EventStoreError>(true)
    })
    .await;

    match outcome {
        Ok(Ok(true)) => Ok(events),
        Ok(Ok(false)) => Err(CollectionError::Ended {
            expected: count,
            received: events.len(),
        }),
        Ok(Err(error)) => Err(error.into()),
        Err(_) => Err(CollectionError::Timeout {
            expected: count,
            received: events.len(),
        }),
    }
}

/// Waits until `subscription` completes, returning any events delivered first.
pub async fn drain_until_complete(
    subscription: &mut CatchUpSubscription,
    timeout: Duration,
) -> Result<Vec<Event>, CollectionError> {
    let mut events = Vec::new();
    let outcome = tokio::time::timeout(timeout, async {
        while let Some(event) = subscription.next().await? {
            events.push(event);
        }
        Ok::<_, EventStoreError>(())
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok(events),
        Ok(Err(error)) => Err(error.into()),
        Err(_) => Err(CollectionError::StillOpen {
            received: events.len(),
        }),
    }
}
