//! Application-facing façade over one configured stream.
//!
//! Starting the service migrates the stream to its latest version and then
//! replays it into the domain index cache. Afterwards every event appended
//! through the service is persisted first and then forwarded to the cache.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::EventStoreConfig;
use crate::diff;
use crate::errors::{EntityResult, EventParseFailure, EventStoreResult, MigrationResult};
use crate::event::Event;
use crate::index::InMemoryCache;
use crate::migration::{MigrationCatalog, StreamMigrator};
use crate::replay;
use crate::resource::{ResourceType, ResourceTypeRegistry};
use crate::schema::Entity;
use crate::stream::{EventStore, EventStream};
use crate::transaction::EventStreamTransaction;
use crate::types::UserId;

/// Event store service bound to the configured stream.
#[derive(Debug)]
pub struct EventStoreService<S: EventStore> {
    store: S,
    config: EventStoreConfig,
    registry: Arc<ResourceTypeRegistry>,
    cache: InMemoryCache,
}

impl<S: EventStore> EventStoreService<S> {
    /// Migrates the configured stream and populates `cache` from it.
    #[instrument(skip_all, fields(host = %config.host, stream = %config.stream))]
    pub async fn start(
        store: S,
        config: EventStoreConfig,
        catalog: &MigrationCatalog,
        registry: Arc<ResourceTypeRegistry>,
        cache: InMemoryCache,
    ) -> MigrationResult<Self> {
        info!("using stream '{}' on '{}'", config.stream, config.host);

        let (from_version, to_version) =
            StreamMigrator::migrate(&store, &config.stream, catalog).await?;
        if from_version != to_version {
            info!(
                "migrated stream '{}' from version '{}' to version '{}'",
                config.stream, from_version, to_version
            );
        }

        let service = Self {
            store,
            config,
            registry,
            cache,
        };
        service.populate_indices().await?;
        Ok(service)
    }

    async fn populate_indices(&self) -> EventStoreResult<()> {
        let mut events = self.stream().await?.enumerator()?;
        events.on_parse_failure(Arc::new(|failure: &EventParseFailure| {
            warn!("could not process an event: {failure}");
        }));

        let mut total = 0_usize;
        while let Some(event) = events.next().await? {
            total += 1;
            self.cache.apply_event(&event);
        }

        info!("populated indices with {total} events");
        Ok(())
    }

    /// The current handle of the configured stream.
    pub async fn stream(&self) -> EventStoreResult<Arc<S::Stream>> {
        self.store.stream(&self.config.stream).await
    }

    /// The settings the service was started with.
    pub const fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    /// The domain index cache.
    pub const fn cache(&self) -> &InMemoryCache {
        &self.cache
    }

    /// The resource type registry.
    pub fn registry(&self) -> &ResourceTypeRegistry {
        &self.registry
    }

    /// Appends one event.
    pub async fn append_event(&self, event: Event) -> EventStoreResult<()> {
        self.append_events(vec![event]).await
    }

    /// Appends `events` as one batch, then forwards each to the cache.
    pub async fn append_events(&self, events: Vec<Event>) -> EventStoreResult<()> {
        self.stream().await?.append(events.clone()).await?;
        for event in &events {
            self.cache.apply_event(event);
        }
        Ok(())
    }

    /// Starts a transaction on the configured stream.
    pub async fn begin_transaction(&self) -> EventStoreResult<EventStreamTransaction> {
        self.stream().await?.begin_transaction().await
    }

    /// Commits `transaction`, then forwards its events to the cache.
    pub async fn commit_transaction(
        &self,
        transaction: EventStreamTransaction,
    ) -> EventStoreResult<()> {
        let events = transaction.staged().to_vec();
        transaction.commit().await?;
        for event in &events {
            self.cache.apply_event(event);
        }
        Ok(())
    }

    /// Appends the events creating `entity`.
    pub async fn create_entity<T: Entity>(
        &self,
        resource_type: &ResourceType,
        id: i32,
        user_id: impl Into<UserId>,
        entity: &T,
    ) -> EntityResult<()> {
        let events = diff::create_entity(entity, resource_type, id, user_id)?;
        Ok(self.append_events(events).await?)
    }

    /// Appends the property changes turning `old` into `new`.
    pub async fn update_entity<T: Entity>(
        &self,
        resource_type: &ResourceType,
        id: i32,
        user_id: impl Into<UserId>,
        old: &T,
        new: &T,
    ) -> EntityResult<()> {
        let events = diff::compare(old, new, resource_type, id, user_id)?;
        if events.is_empty() {
            return Ok(());
        }
        Ok(self.append_events(events).await?)
    }

    /// Appends the `Deleted` event for an entity.
    pub async fn delete_entity(
        &self,
        resource_type: &ResourceType,
        id: i32,
        user_id: impl Into<UserId>,
    ) -> EventStoreResult<()> {
        self.append_event(diff::delete_entity(resource_type, id, user_id))
            .await
    }

    /// Reconstructs an entity from the configured stream.
    pub async fn current_entity<T: Entity>(
        &self,
        resource_type: &ResourceType,
        id: i32,
    ) -> EntityResult<Option<T>> {
        let stream = self.stream().await?;
        replay::current_entity::<T, S::Stream>(stream.as_ref(), &self.registry, resource_type, id)
            .await
    }
}
