//! Stream migrations: version-tagged, whole-stream rewrites.
//!
//! A stream's version lives in its metadata under
//! [`STREAM_VERSION_METADATA_KEY`] (absent means version 0). Migrations are
//! registered in a [`MigrationCatalog`] as `(from, to, migration)` triples.
//! Migrating repeatedly picks the migration starting at the current version,
//! lets it read the full history and emit replacement events, deletes the
//! stream, writes the replacement events to a fresh generation and records
//! the new version.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::errors::{EventStoreResult, MigrationError, MigrationResult};
use crate::event::Event;
use crate::stream::{EventStore, EventStream, MetadataValue, STREAM_VERSION_METADATA_KEY};
use crate::subscription::EventStreamEnumerator;
use crate::types::StreamName;

/// What a migration sees: the existing history and a sink for the events
/// that make up the migrated stream.
#[derive(Debug)]
pub struct StreamMigrationArgs {
    existing: EventStreamEnumerator,
    appended: Vec<Event>,
}

impl StreamMigrationArgs {
    /// Wraps the history of the stream being migrated.
    pub fn new(existing: EventStreamEnumerator) -> Self {
        Self {
            existing,
            appended: Vec::new(),
        }
    }

    /// Reader over the existing events.
    pub fn existing_events(&mut self) -> &mut EventStreamEnumerator {
        &mut self.existing
    }

    /// Reads the next existing event.
    pub async fn next_existing(&mut self) -> EventStoreResult<Option<Event>> {
        self.existing.next().await
    }

    /// Adds an event to the migrated stream.
    pub fn append_event(&mut self, event: Event) {
        self.appended.push(event);
    }

    /// The events emitted so far.
    pub fn appended(&self) -> &[Event] {
        &self.appended
    }

    fn into_appended(self) -> Vec<Event> {
        self.appended
    }
}

/// A whole-stream transformation.
#[async_trait]
pub trait StreamMigration: Send + Sync {
    /// Reads `args.existing_events()` and emits the migrated stream through
    /// `args.append_event`.
    async fn migrate(&self, args: &mut StreamMigrationArgs) -> MigrationResult<()>;
}

/// Applies a per-event mapping to every existing event.
struct EventMapMigration<F> {
    map: F,
}

#[async_trait]
impl<F> StreamMigration for EventMapMigration<F>
where
    F: Fn(Event) -> Vec<Event> + Send + Sync,
{
    async fn migrate(&self, args: &mut StreamMigrationArgs) -> MigrationResult<()> {
        while let Some(event) = args.next_existing().await? {
            for mapped in (self.map)(event) {
                args.append_event(mapped);
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
struct MigrationDescriptor {
    from_version: u32,
    to_version: u32,
    migration: Arc<dyn StreamMigration>,
}

/// The registered migrations, in registration order.
#[derive(Clone, Default)]
pub struct MigrationCatalog {
    descriptors: Vec<MigrationDescriptor>,
}

impl MigrationCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a migration from `from_version` to `to_version`.
    ///
    /// Migrations that do not move forward are ignored.
    #[must_use]
    pub fn register(
        mut self,
        from_version: u32,
        to_version: u32,
        migration: impl StreamMigration + 'static,
    ) -> Self {
        if to_version <= from_version {
            warn!(
                from_version,
                to_version, "ignoring migration that does not increase the stream version"
            );
            return self;
        }
        self.descriptors.push(MigrationDescriptor {
            from_version,
            to_version,
            migration: Arc::new(migration),
        });
        self
    }

    /// Registers a migration that maps each existing event to zero or more
    /// replacement events.
    #[must_use]
    pub fn register_fn<F>(self, from_version: u32, to_version: u32, map: F) -> Self
    where
        F: Fn(Event) -> Vec<Event> + Send + Sync + 'static,
    {
        self.register(from_version, to_version, EventMapMigration { map })
    }

    /// Number of registered migrations.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether no migration is registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Migrations applicable from `current`, keyed by source version.
    fn applicable_from(
        &self,
        current: u32,
    ) -> MigrationResult<BTreeMap<u32, &MigrationDescriptor>> {
        let mut applicable = BTreeMap::new();
        for descriptor in self
            .descriptors
            .iter()
            .filter(|descriptor| descriptor.from_version >= current)
        {
            if applicable
                .insert(descriptor.from_version, descriptor)
                .is_some()
            {
                return Err(MigrationError::Ambiguous {
                    from_version: descriptor.from_version,
                });
            }
        }
        Ok(applicable)
    }
}

impl fmt::Debug for MigrationCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.descriptors
                    .iter()
                    .map(|d| (d.from_version, d.to_version)),
            )
            .finish()
    }
}

async fn read_version<S: EventStream>(stream: &S) -> MigrationResult<u32> {
    match stream.try_get_metadata(STREAM_VERSION_METADATA_KEY).await? {
        None => Ok(0),
        Some(value) => value
            .as_i64()
            .and_then(|version| u32::try_from(version).ok())
            .ok_or_else(|| MigrationError::InvalidVersion {
                stream: stream.name().clone(),
                value: format!("{value:?}"),
            }),
    }
}

/// Brings a stream up to the latest version reachable through a catalog.
pub struct StreamMigrator;

impl StreamMigrator {
    /// Migrates `stream_name` and returns the `(initial, final)` versions.
    ///
    /// Ambiguous catalogs are rejected before the stream is touched.
    #[instrument(skip(store, stream_name, catalog), fields(stream = %stream_name))]
    pub async fn migrate<S: EventStore>(
        store: &S,
        stream_name: &StreamName,
        catalog: &MigrationCatalog,
    ) -> MigrationResult<(u32, u32)> {
        let mut stream = store.stream(stream_name).await?;
        let initial = read_version(stream.as_ref()).await?;
        let applicable = catalog.applicable_from(initial)?;

        let mut current = initial;
        while let Some(descriptor) = applicable.get(&current) {
            debug!(
                from_version = descriptor.from_version,
                to_version = descriptor.to_version,
                "applying stream migration"
            );

            let mut args = StreamMigrationArgs::new(stream.enumerator()?);
            descriptor.migration.migrate(&mut args).await?;
            let migrated = args.into_appended();

            stream.delete().await?;
            stream = store.stream(stream_name).await?;
            stream.append(migrated).await?;
            stream
                .set_metadata(
                    STREAM_VERSION_METADATA_KEY,
                    MetadataValue::from(descriptor.to_version),
                )
                .await?;

            current = descriptor.to_version;
        }

        if current != initial {
            info!(
                from_version = initial,
                to_version = current,
                "migrated stream"
            );
        }
        Ok((initial, current))
    }
}
