use std::collections::HashSet;

use async_trait::async_trait;
use entitystore::prelude::*;
use entitystore::{MigrationResult, STREAM_VERSION_METADATA_KEY};
use entitystore_memory::InMemoryEventStore;
use serde_json::json;

struct Account;

fn accounts() -> ResourceType {
    ResourceTypeRegistry::new()
        .register::<Account>("Account", None)
        .expect("valid resource type")
}

fn stream_name() -> StreamName {
    StreamName::try_new("accounts").expect("valid stream name")
}

fn renamed(event: Event) -> Vec<Event> {
    let Some(change) = event.property_change() else {
        return vec![event];
    };
    if change.property_path.as_str() != "Owner" {
        return vec![event];
    }
    let mut renamed = event.clone();
    if let EventKind::PropertyChanged(change) = &mut renamed.kind {
        change.property_path = "Holder".into();
    }
    vec![renamed]
}

async fn seed(store: &InMemoryEventStore) {
    let resource_type = accounts();
    let change = PropertyChange {
        property_path: "Owner".into(),
        value: json!("ada"),
        value_type_name: "String".to_string(),
    };
    store
        .stream(&stream_name())
        .await
        .unwrap()
        .append(vec![
            Event::created(&resource_type, 1, "u"),
            Event::property_changed(&resource_type, 1, "u", change),
        ])
        .await
        .unwrap();
}

async fn version(store: &InMemoryEventStore) -> Option<MetadataValue> {
    store
        .stream(&stream_name())
        .await
        .unwrap()
        .try_get_metadata(STREAM_VERSION_METADATA_KEY)
        .await
        .unwrap()
}

async fn property_paths(store: &InMemoryEventStore) -> Vec<String> {
    store
        .stream(&stream_name())
        .await
        .unwrap()
        .events()
        .iter()
        .filter_map(Event::property_change)
        .map(|change| change.property_path.to_string())
        .collect()
}

/// Drops every event of entities that end up deleted.
struct Compaction;

#[async_trait]
impl StreamMigration for Compaction {
    async fn migrate(&self, args: &mut StreamMigrationArgs) -> MigrationResult<()> {
        let mut existing = Vec::new();
        while let Some(event) = args.next_existing().await? {
            existing.push(event);
        }
        let deleted: HashSet<i32> = existing
            .iter()
            .filter(|event| event.kind == EventKind::Deleted)
            .map(|event| event.entity_id)
            .collect();
        for event in existing {
            if !deleted.contains(&event.entity_id) {
                args.append_event(event);
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn unversioned_streams_migrate_from_zero() {
    // Given
    let store = InMemoryEventStore::new();
    seed(&store).await;
    let catalog = MigrationCatalog::new().register_fn(0, 1, renamed);

    // When
    let versions = StreamMigrator::migrate(&store, &stream_name(), &catalog)
        .await
        .unwrap();

    // Then
    assert_eq!(versions, (0, 1));
    assert_eq!(version(&store).await, Some(MetadataValue::Int(1)));
    assert_eq!(property_paths(&store).await, vec!["Holder"]);
}

#[tokio::test]
async fn migrations_chain_until_no_step_applies() {
    let store = InMemoryEventStore::new();
    seed(&store).await;
    let resource_type = accounts();
    let catalog = MigrationCatalog::new()
        .register_fn(1, 3, move |event| {
            let mut events = vec![event.clone()];
            if event.kind == EventKind::Created {
                events.push(Event::deleted(&resource_type, event.entity_id, "migration"));
            }
            events
        })
        .register_fn(0, 1, renamed)
        .register(3, 4, Compaction);

    let versions = StreamMigrator::migrate(&store, &stream_name(), &catalog)
        .await
        .unwrap();

    assert_eq!(versions, (0, 4));
    assert_eq!(version(&store).await, Some(MetadataValue::Int(4)));
    let stream = store.stream(&stream_name()).await.unwrap();
    assert!(stream.events().is_empty());
}

#[tokio::test]
async fn migrating_twice_is_a_no_op() {
    // Given: a stream already migrated once
    let store = InMemoryEventStore::new();
    seed(&store).await;
    let catalog = MigrationCatalog::new().register_fn(0, 1, renamed);
    StreamMigrator::migrate(&store, &stream_name(), &catalog)
        .await
        .unwrap();
    let before = store.stream(&stream_name()).await.unwrap();
    let events_before = before.events();

    // When
    let versions = StreamMigrator::migrate(&store, &stream_name(), &catalog)
        .await
        .unwrap();

    // Then: same handle, same events
    assert_eq!(versions, (1, 1));
    let after = store.stream(&stream_name()).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&before, &after));
    assert_eq!(after.events(), events_before);
}

#[tokio::test]
async fn ambiguous_catalogs_fail_before_touching_the_stream() {
    let store = InMemoryEventStore::new();
    seed(&store).await;
    let handle = store.stream(&stream_name()).await.unwrap();
    let catalog = MigrationCatalog::new()
        .register_fn(0, 1, renamed)
        .register_fn(0, 2, |event| vec![event]);

    let result = StreamMigrator::migrate(&store, &stream_name(), &catalog).await;

    assert!(matches!(
        result,
        Err(MigrationError::Ambiguous { from_version: 0 })
    ));
    assert!(!handle.is_deleted());
    assert_eq!(property_paths(&store).await, vec!["Owner"]);
    assert_eq!(version(&store).await, None);
}

#[tokio::test]
async fn migrations_below_the_current_version_are_ignored() {
    let store = InMemoryEventStore::new();
    seed(&store).await;
    store
        .stream(&stream_name())
        .await
        .unwrap()
        .set_metadata(STREAM_VERSION_METADATA_KEY, MetadataValue::from(2_u32))
        .await
        .unwrap();
    // Two migrations from version 0 would be ambiguous, but neither applies
    let catalog = MigrationCatalog::new()
        .register_fn(0, 1, renamed)
        .register_fn(0, 2, renamed);

    let versions = StreamMigrator::migrate(&store, &stream_name(), &catalog)
        .await
        .unwrap();

    assert_eq!(versions, (2, 2));
    assert_eq!(property_paths(&store).await, vec!["Owner"]);
}

#[tokio::test]
async fn non_integer_versions_are_rejected() {
    let store = InMemoryEventStore::new();
    store
        .stream(&stream_name())
        .await
        .unwrap()
        .set_metadata(STREAM_VERSION_METADATA_KEY, MetadataValue::from("v2"))
        .await
        .unwrap();

    let result = StreamMigrator::migrate(&store, &stream_name(), &MigrationCatalog::new()).await;

    assert!(matches!(result, Err(MigrationError::InvalidVersion { .. })));
}

#[test]
fn backwards_migrations_are_not_registered() {
    let catalog = MigrationCatalog::new()
        .register_fn(2, 2, |event| vec![event])
        .register_fn(3, 1, |event| vec![event])
        .register_fn(0, 1, |event| vec![event]);

    assert_eq!(catalog.len(), 1);
}
