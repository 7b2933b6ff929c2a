//! Behavioral contract every stream backend must satisfy.
//!
//! Each `test_*` function builds a store through the supplied factory, runs
//! one scenario on a uniquely named stream and reports the first deviation as
//! a [`ContractTestFailure`]. Backends usually invoke
//! [`event_stream_contract_tests!`] rather than calling them one by one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use entitystore::errors::EventStoreError;
use entitystore::event::Event;
use entitystore::resource::{ResourceType, ResourceTypeRegistry};
use entitystore::stream::{EventStore, EventStream, MetadataValue, STREAM_VERSION_METADATA_KEY};
use entitystore::types::StreamName;
use uuid::Uuid;

use crate::collect::{collect_events, drain_until_complete};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_PROBE: Duration = Duration::from_millis(100);
// Larger than the default subscriber queue, so an idle subscriber fills up
const STALLING_BATCH: i32 = 4096;

fn batch_len() -> usize {
    usize::try_from(STALLING_BATCH).unwrap_or_default()
}

/// A scenario that did not behave as required.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(
        scenario: &'static str,
        operation: &'static str,
        error: impl fmt::Display,
    ) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

struct ContractEntity;

fn contract_resource_type(scenario: &'static str) -> Result<ResourceType, ContractTestFailure> {
    ResourceTypeRegistry::new()
        .register::<ContractEntity>("ContractEntity", None)
        .map_err(|error| {
            ContractTestFailure::assertion(
                scenario,
                format!("unable to register resource type: {error}"),
            )
        })
}

fn contract_stream_name(scenario: &'static str) -> Result<StreamName, ContractTestFailure> {
    // Unique per run so stores shared between scenarios stay isolated
    let raw = format!("contract-{}-{}", scenario, Uuid::now_v7());

    StreamName::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to construct stream name `{raw}`: {error}"),
        )
    })
}

fn created(resource_type: &ResourceType, ids: impl IntoIterator<Item = i32>) -> Vec<Event> {
    ids.into_iter()
        .map(|id| Event::created(resource_type, id, "contract"))
        .collect()
}

fn entity_ids(events: &[Event]) -> Vec<i32> {
    events.iter().map(|event| event.entity_id).collect()
}

async fn open_stream<S: EventStore>(
    scenario: &'static str,
    store: &S,
    name: &StreamName,
) -> Result<Arc<S::Stream>, ContractTestFailure> {
    store
        .stream(name)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "stream", error))
}

async fn append<T: EventStream + ?Sized>(
    scenario: &'static str,
    stream: &T,
    events: Vec<Event>,
) -> ContractTestResult {
    stream
        .append(events)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "append", error))
}

async fn read_ids<T: EventStream + ?Sized>(
    scenario: &'static str,
    stream: &T,
) -> Result<Vec<i32>, ContractTestFailure> {
    let mut enumerator = stream
        .enumerator()
        .map_err(|error| ContractTestFailure::store_error(scenario, "enumerator", error))?;
    let events = enumerator
        .read_to_end()
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "read", error))?;
    Ok(entity_ids(&events))
}

fn expect_ids(scenario: &'static str, observed: &[i32], expected: &[i32]) -> ContractTestResult {
    if observed == expected {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            scenario,
            format!("expected events {expected:?} but observed {observed:?}"),
        ))
    }
}

fn expect_deleted<T>(
    scenario: &'static str,
    operation: &'static str,
    result: Result<T, EventStoreError>,
) -> ContractTestResult {
    match result {
        Err(EventStoreError::StreamDeleted { .. }) => Ok(()),
        Err(error) => Err(ContractTestFailure::store_error(scenario, operation, error)),
        Ok(_) => Err(ContractTestFailure::assertion(
            scenario,
            format!("expected {operation} on a deleted stream to fail but it succeeded"),
        )),
    }
}

/// Batches and single appends are read back in append order.
pub async fn test_append_preserves_order<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "append_preserves_order";

    let store = make_store();
    let resource_type = contract_resource_type(SCENARIO)?;
    let stream = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;

    append(SCENARIO, stream.as_ref(), created(&resource_type, 1..=3)).await?;
    stream
        .append_one(Event::created(&resource_type, 4, "contract"))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "append_one", error))?;
    append(SCENARIO, stream.as_ref(), Vec::new()).await?;

    expect_ids(SCENARIO, &read_ids(SCENARIO, stream.as_ref()).await?, &[1, 2, 3, 4])
}

/// Repeated lookups return the same handle.
pub async fn test_handles_are_cached<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "handles_are_cached";

    let store = make_store();
    let name = contract_stream_name(SCENARIO)?;
    let first = open_stream(SCENARIO, &store, &name).await?;
    let second = open_stream(SCENARIO, &store, &name).await?;

    if !Arc::ptr_eq(&first, &second) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected the same handle for repeated lookups of one name",
        ));
    }
    if first.name() != &name {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("handle reports name {} instead of {name}", first.name()),
        ));
    }
    Ok(())
}

/// Each enumerator is an independent cursor that can be rewound.
pub async fn test_enumerators_are_independent<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "enumerators_are_independent";

    let store = make_store();
    let resource_type = contract_resource_type(SCENARIO)?;
    let stream = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;
    append(SCENARIO, stream.as_ref(), created(&resource_type, 1..=2)).await?;

    let enumerate =
        |error: EventStoreError| ContractTestFailure::store_error(SCENARIO, "enumerator", error);
    let step = |error: EventStoreError| ContractTestFailure::store_error(SCENARIO, "next", error);
    let mut first = stream.enumerator().map_err(enumerate)?;
    let mut second = stream.enumerator().map_err(enumerate)?;

    let mut observed = Vec::new();
    observed.push(first.next().await.map_err(step)?);
    observed.push(second.next().await.map_err(step)?);
    observed.push(first.next().await.map_err(step)?);
    first.reset();
    observed.push(first.next().await.map_err(step)?);
    let observed: Vec<_> = observed
        .into_iter()
        .map(|event| event.map(|event| event.entity_id))
        .collect();

    if observed == [Some(1), Some(1), Some(2), Some(1)] {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("cursors interfered with each other: {observed:?}"),
        ))
    }
}

/// Every operation on a deleted handle fails with `StreamDeleted`.
pub async fn test_deleted_stream_rejects_operations<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "deleted_stream_rejects_operations";

    let store = make_store();
    let resource_type = contract_resource_type(SCENARIO)?;
    let stream = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;
    append(SCENARIO, stream.as_ref(), created(&resource_type, [1])).await?;

    stream
        .delete()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "delete", error))?;
    if !stream.is_deleted() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "handle does not report itself deleted",
        ));
    }

    expect_deleted(
        SCENARIO,
        "append",
        stream.append(created(&resource_type, [2])).await,
    )?;
    expect_deleted(
        SCENARIO,
        "begin_transaction",
        stream.begin_transaction().await,
    )?;
    expect_deleted(
        SCENARIO,
        "set_metadata",
        stream.set_metadata("Owner", MetadataValue::from("x")).await,
    )?;
    expect_deleted(
        SCENARIO,
        "try_get_metadata",
        stream.try_get_metadata("Owner").await,
    )?;
    expect_deleted(SCENARIO, "enumerator", stream.enumerator())?;
    expect_deleted(
        SCENARIO,
        "subscribe_catch_up",
        stream.subscribe_catch_up().await,
    )?;
    expect_deleted(SCENARIO, "delete", stream.delete().await)
}

/// After deletion the store hands out a fresh, empty generation of the stream.
pub async fn test_fresh_handle_after_delete<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "fresh_handle_after_delete";

    let store = make_store();
    let resource_type = contract_resource_type(SCENARIO)?;
    let name = contract_stream_name(SCENARIO)?;
    let stream = open_stream(SCENARIO, &store, &name).await?;
    append(SCENARIO, stream.as_ref(), created(&resource_type, 1..=2)).await?;
    stream
        .set_metadata(STREAM_VERSION_METADATA_KEY, MetadataValue::from(2_u32))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "set_metadata", error))?;
    stream
        .delete()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "delete", error))?;

    let fresh = open_stream(SCENARIO, &store, &name).await?;
    if Arc::ptr_eq(&stream, &fresh) || fresh.is_deleted() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected a new live handle after deletion",
        ));
    }
    expect_ids(SCENARIO, &read_ids(SCENARIO, fresh.as_ref()).await?, &[])?;

    let version = fresh
        .try_get_metadata(STREAM_VERSION_METADATA_KEY)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "try_get_metadata", error))?;
    if version.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("metadata survived deletion: {version:?}"),
        ));
    }

    append(SCENARIO, fresh.as_ref(), created(&resource_type, [3])).await?;
    expect_ids(SCENARIO, &read_ids(SCENARIO, fresh.as_ref()).await?, &[3])
}

/// Staged events become visible only on commit, as one batch.
pub async fn test_transaction_commit<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "transaction_commit";

    let store = make_store();
    let resource_type = contract_resource_type(SCENARIO)?;
    let stream = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;

    let mut transaction = stream
        .begin_transaction()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "begin_transaction", error))?;
    transaction.append(Event::created(&resource_type, 1, "contract"));
    transaction.append_many(created(&resource_type, 2..=3));

    expect_ids(SCENARIO, &read_ids(SCENARIO, stream.as_ref()).await?, &[])?;

    transaction
        .commit()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", error))?;

    expect_ids(SCENARIO, &read_ids(SCENARIO, stream.as_ref()).await?, &[1, 2, 3])
}

/// An open transaction holds the writer lock until it commits.
pub async fn test_transaction_holds_writer_lock<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "transaction_holds_writer_lock";

    let store = make_store();
    let resource_type = contract_resource_type(SCENARIO)?;
    let stream = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;

    let mut transaction = stream
        .begin_transaction()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "begin_transaction", error))?;
    transaction.append(Event::created(&resource_type, 1, "contract"));

    let writer = Arc::clone(&stream);
    let blocked = Event::created(&resource_type, 2, "contract");
    let mut pending = tokio::spawn(async move { writer.append_one(blocked).await });

    if tokio::time::timeout(LOCK_PROBE, &mut pending).await.is_ok() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "append completed while a transaction held the writer lock",
        ));
    }

    transaction
        .commit()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", error))?;

    match tokio::time::timeout(RECEIVE_TIMEOUT, pending).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(error))) => {
            return Err(ContractTestFailure::store_error(SCENARIO, "append", error))
        }
        Ok(Err(error)) => {
            return Err(ContractTestFailure::store_error(SCENARIO, "join", error))
        }
        Err(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "append never acquired the lock after commit",
            ))
        }
    }

    expect_ids(SCENARIO, &read_ids(SCENARIO, stream.as_ref()).await?, &[1, 2])
}

/// Dropping a transaction discards its batch and releases the lock.
pub async fn test_dropped_transaction_discards<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "dropped_transaction_discards";

    let store = make_store();
    let resource_type = contract_resource_type(SCENARIO)?;
    let stream = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;

    let mut transaction = stream
        .begin_transaction()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "begin_transaction", error))?;
    transaction.append(Event::created(&resource_type, 1, "contract"));
    drop(transaction);

    let appended = tokio::time::timeout(
        RECEIVE_TIMEOUT,
        stream.append_one(Event::created(&resource_type, 2, "contract")),
    )
    .await
    .map_err(|_| {
        ContractTestFailure::assertion(SCENARIO, "writer lock was not released on drop")
    })?;
    appended.map_err(|error| ContractTestFailure::store_error(SCENARIO, "append", error))?;

    expect_ids(SCENARIO, &read_ids(SCENARIO, stream.as_ref()).await?, &[2])
}

/// Metadata values round-trip and missing keys read as absent.
pub async fn test_metadata_round_trip<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "metadata_round_trip";

    let store = make_store();
    let stream = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;
    let get =
        |error: EventStoreError| ContractTestFailure::store_error(SCENARIO, "try_get_metadata", error);
    let set =
        |error: EventStoreError| ContractTestFailure::store_error(SCENARIO, "set_metadata", error);

    let missing = stream
        .try_get_metadata(STREAM_VERSION_METADATA_KEY)
        .await
        .map_err(get)?;
    if missing.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("fresh stream has metadata {missing:?}"),
        ));
    }

    stream
        .set_metadata(STREAM_VERSION_METADATA_KEY, MetadataValue::from(3_u32))
        .await
        .map_err(set)?;
    stream
        .set_metadata("Owner", MetadataValue::from("billing"))
        .await
        .map_err(set)?;
    stream
        .set_metadata(STREAM_VERSION_METADATA_KEY, MetadataValue::from(4_u32))
        .await
        .map_err(set)?;

    let version = stream
        .try_get_metadata(STREAM_VERSION_METADATA_KEY)
        .await
        .map_err(get)?;
    let owner = stream.try_get_metadata("Owner").await.map_err(get)?;
    if version != Some(MetadataValue::Int(4)) || owner != Some(MetadataValue::from("billing")) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("metadata read back as {version:?} and {owner:?}"),
        ));
    }

    match stream.set_metadata(" ", MetadataValue::from(true)).await {
        Err(EventStoreError::ArgumentInvalid(_)) => Ok(()),
        Err(error) => Err(ContractTestFailure::store_error(
            SCENARIO,
            "set_metadata",
            error,
        )),
        Ok(()) => Err(ContractTestFailure::assertion(
            SCENARIO,
            "blank metadata key was accepted",
        )),
    }
}

/// A catch-up subscription delivers history, then live appends, exactly once.
pub async fn test_catch_up_delivers_history_then_live<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "catch_up_delivers_history_then_live";

    let store = make_store();
    let resource_type = contract_resource_type(SCENARIO)?;
    let stream = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;
    append(SCENARIO, stream.as_ref(), created(&resource_type, 1..=2)).await?;

    let mut subscription = stream
        .subscribe_catch_up()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "subscribe_catch_up", error))?;

    append(SCENARIO, stream.as_ref(), created(&resource_type, [3])).await?;
    append(SCENARIO, stream.as_ref(), created(&resource_type, 4..=5)).await?;

    let events = collect_events(&mut subscription, 5, RECEIVE_TIMEOUT)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "collect", error))?;
    expect_ids(SCENARIO, &entity_ids(&events), &[1, 2, 3, 4, 5])?;

    append(SCENARIO, stream.as_ref(), created(&resource_type, [6])).await?;
    let events = collect_events(&mut subscription, 1, RECEIVE_TIMEOUT)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "collect", error))?;
    expect_ids(SCENARIO, &entity_ids(&events), &[6])
}

/// Deleting the stream completes its subscriptions.
pub async fn test_subscription_completes_on_delete<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "subscription_completes_on_delete";

    let store = make_store();
    let resource_type = contract_resource_type(SCENARIO)?;
    let stream = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;

    let mut subscription = stream
        .subscribe_catch_up()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "subscribe_catch_up", error))?;
    append(SCENARIO, stream.as_ref(), created(&resource_type, [1])).await?;
    let delivered = collect_events(&mut subscription, 1, RECEIVE_TIMEOUT)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "collect", error))?;
    expect_ids(SCENARIO, &entity_ids(&delivered), &[1])?;

    stream
        .delete()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "delete", error))?;

    let trailing = drain_until_complete(&mut subscription, RECEIVE_TIMEOUT)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "drain", error))?;
    expect_ids(SCENARIO, &entity_ids(&trailing), &[])
}

/// Concurrent writers never interleave inside a batch.
pub async fn test_concurrent_batches_stay_contiguous<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "concurrent_batches_stay_contiguous";
    const WRITERS: i32 = 4;
    const BATCHES: i32 = 20;
    const BATCH_LEN: i32 = 3;

    let store = make_store();
    let resource_type = contract_resource_type(SCENARIO)?;
    let stream = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;

    let mut writers = Vec::new();
    for writer in 0..WRITERS {
        let stream = Arc::clone(&stream);
        let resource_type = resource_type.clone();
        writers.push(tokio::spawn(async move {
            for batch in 0..BATCHES {
                let base = (writer * BATCHES + batch) * BATCH_LEN;
                stream
                    .append(created(&resource_type, base..base + BATCH_LEN))
                    .await?;
            }
            Ok::<_, EventStoreError>(())
        }));
    }
    for writer in writers {
        writer
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "join", error))?
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "append", error))?;
    }

    let ids = read_ids(SCENARIO, stream.as_ref()).await?;
    let expected_len = usize::try_from(WRITERS * BATCHES * BATCH_LEN).unwrap_or_default();
    if ids.len() != expected_len {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected {expected_len} events, observed {}", ids.len()),
        ));
    }
    for chunk in ids.chunks(usize::try_from(BATCH_LEN).unwrap_or(1)) {
        let contiguous = chunk[0] % BATCH_LEN == 0
            && chunk.windows(2).all(|pair| pair[1] == pair[0] + 1);
        if !contiguous {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("batch was interleaved: {chunk:?}"),
            ));
        }
    }
    Ok(())
}

/// A subscriber that stops reading one stream never holds up writers of
/// another stream.
pub async fn test_stalled_subscriber_leaves_other_streams_writable<F, S>(
    make_store: F,
) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "stalled_subscriber_leaves_other_streams_writable";

    let store = make_store();
    let resource_type = contract_resource_type(SCENARIO)?;
    let stalled = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;
    let other = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;

    let mut subscription = stalled
        .subscribe_catch_up()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "subscribe_catch_up", error))?;
    let writer = Arc::clone(&stalled);
    let batch = created(&resource_type, 0..STALLING_BATCH);
    let stalled_append = tokio::spawn(async move { writer.append(batch).await });
    tokio::time::sleep(LOCK_PROBE).await;

    match tokio::time::timeout(RECEIVE_TIMEOUT, other.append(created(&resource_type, [1]))).await {
        Ok(result) => {
            result.map_err(|error| ContractTestFailure::store_error(SCENARIO, "append", error))?;
        }
        Err(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "append to an unrelated stream waited on a stalled subscriber",
            ))
        }
    }
    expect_ids(SCENARIO, &read_ids(SCENARIO, other.as_ref()).await?, &[1])?;

    // Reading the backlog releases the stalled writer
    let delivered = collect_events(&mut subscription, batch_len(), RECEIVE_TIMEOUT)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "collect", error))?;
    stalled_append
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "join", error))?
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "append", error))?;
    let expected: Vec<i32> = (0..STALLING_BATCH).collect();
    expect_ids(SCENARIO, &entity_ids(&delivered), &expected)
}

/// Deleting a stream completes its feeds even while a subscriber has stopped
/// reading and a writer is waiting on it.
pub async fn test_delete_completes_despite_stalled_subscriber<F, S>(
    make_store: F,
) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore,
{
    const SCENARIO: &str = "delete_completes_despite_stalled_subscriber";

    let store = make_store();
    let resource_type = contract_resource_type(SCENARIO)?;
    let stream = open_stream(SCENARIO, &store, &contract_stream_name(SCENARIO)?).await?;

    let mut subscription = stream
        .subscribe_catch_up()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "subscribe_catch_up", error))?;
    let writer = Arc::clone(&stream);
    let batch = created(&resource_type, 0..STALLING_BATCH);
    let stalled_append = tokio::spawn(async move { writer.append(batch).await });
    tokio::time::sleep(LOCK_PROBE).await;

    match tokio::time::timeout(RECEIVE_TIMEOUT, stream.delete()).await {
        Ok(result) => {
            result.map_err(|error| ContractTestFailure::store_error(SCENARIO, "delete", error))?;
        }
        Err(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "delete waited on a stalled subscriber",
            ))
        }
    }

    // The writer either finished before the delete or found the stream gone
    match tokio::time::timeout(RECEIVE_TIMEOUT, stalled_append).await {
        Ok(Ok(Ok(()) | Err(EventStoreError::StreamDeleted { .. }))) => {}
        Ok(Ok(Err(error))) => {
            return Err(ContractTestFailure::store_error(SCENARIO, "append", error))
        }
        Ok(Err(error)) => {
            return Err(ContractTestFailure::store_error(SCENARIO, "join", error))
        }
        Err(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "append never returned after the stream was deleted",
            ))
        }
    }

    let trailing = drain_until_complete(&mut subscription, RECEIVE_TIMEOUT)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "drain", error))?;
    let ids = entity_ids(&trailing);
    let expected: Vec<i32> = (0..STALLING_BATCH).take(ids.len()).collect();
    expect_ids(SCENARIO, &ids, &expected)
}

/// Generates one `#[tokio::test]` per contract scenario for a backend.
///
/// ```ignore
/// entitystore_testing::event_stream_contract_tests! {
///     suite = in_memory,
///     make_store = entitystore_memory::InMemoryEventStore::new,
/// }
/// ```
#[macro_export]
macro_rules! event_stream_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_append_preserves_order, test_catch_up_delivers_history_then_live,
                test_concurrent_batches_stay_contiguous,
                test_delete_completes_despite_stalled_subscriber,
                test_deleted_stream_rejects_operations, test_dropped_transaction_discards,
                test_enumerators_are_independent, test_fresh_handle_after_delete,
                test_handles_are_cached, test_metadata_round_trip,
                test_stalled_subscriber_leaves_other_streams_writable,
                test_subscription_completes_on_delete, test_transaction_commit,
                test_transaction_holds_writer_lock,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn append_preserves_order_contract() {
                test_append_preserves_order($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn handles_are_cached_contract() {
                test_handles_are_cached($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn enumerators_are_independent_contract() {
                test_enumerators_are_independent($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn deleted_stream_rejects_operations_contract() {
                test_deleted_stream_rejects_operations($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn fresh_handle_after_delete_contract() {
                test_fresh_handle_after_delete($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn transaction_commit_contract() {
                test_transaction_commit($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn transaction_holds_writer_lock_contract() {
                test_transaction_holds_writer_lock($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn dropped_transaction_discards_contract() {
                test_dropped_transaction_discards($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn metadata_round_trip_contract() {
                test_metadata_round_trip($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn catch_up_delivers_history_then_live_contract() {
                test_catch_up_delivers_history_then_live($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn subscription_completes_on_delete_contract() {
                test_subscription_completes_on_delete($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_batches_stay_contiguous_contract() {
                test_concurrent_batches_stay_contiguous($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn stalled_subscriber_leaves_other_streams_writable_contract() {
                test_stalled_subscriber_leaves_other_streams_writable($make_store)
                    .await
                    .expect("event stream contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn delete_completes_despite_stalled_subscriber_contract() {
                test_delete_completes_despite_stalled_subscriber($make_store)
                    .await
                    .expect("event stream contract failed");
            }
        }
    };
}

pub use event_stream_contract_tests;
