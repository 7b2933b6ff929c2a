//! # entitystore
//!
//! Event-sourced entity storage. Entities are persisted as a sequence of
//! `Created`, `PropertyChanged` and `Deleted` events appended to named,
//! totally ordered streams, and reconstructed on demand by replaying them.
//!
//! ## Building blocks
//!
//! - [`resource`]: the registry mapping resource type names to Rust types
//! - [`event`] and [`envelope`]: the event model and its wire format
//! - [`stream`], [`transaction`], [`subscription`]: append-only streams with an
//!   asynchronous writer lock, staged batches, historical enumerators and
//!   catch-up subscriptions
//! - [`log`]: streams backed by a networked log server
//! - [`schema`], [`diff`], [`replay`]: reflection-free field tables, the diff
//!   engine turning snapshots into events and the fold turning events back
//!   into entities
//! - [`migration`]: version-tagged whole-stream rewrites
//! - [`index`] and [`service`]: domain indices fed with every applied event and
//!   the façade tying everything to one configured stream
//!
//! ## Example
//!
//! ```rust,ignore
//! use entitystore::prelude::*;
//! use entitystore_macros::Entity;
//! use entitystore_memory::InMemoryEventStore;
//!
//! #[derive(Debug, Default, PartialEq, Entity)]
//! struct Widget {
//!     #[entity(rename = "Name")]
//!     name: String,
//!     #[entity(rename = "Count")]
//!     count: i32,
//! }
//!
//! let registry = ResourceTypeRegistry::new();
//! let widgets = registry.register::<Widget>("Widget", None)?;
//! let store = InMemoryEventStore::new();
//! let stream = store.stream(&StreamName::try_new("main")?).await?;
//!
//! let widget = Widget { name: "A".into(), count: 0 };
//! stream.append(create_entity(&widget, &widgets, 1, "alice")?).await?;
//!
//! let current: Option<Widget> = current_entity(stream.as_ref(), &registry, &widgets, 1).await?;
//! assert_eq!(current, Some(widget));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod diff;
pub mod envelope;
pub mod errors;
pub mod event;
pub mod index;
pub mod log;
pub mod migration;
pub mod replay;
pub mod resource;
pub mod schema;
pub mod service;
pub mod stream;
pub mod subscription;
pub mod transaction;
pub mod types;

pub use config::{EndpointAddress, EventStoreConfig, SubscriberCapacity};
pub use diff::{compare, create_entity, delete_entity, DiffMode};
pub use errors::{
    EntityError, EntityResult, EventParseFailure, EventStoreError, EventStoreResult,
    MigrationError, MigrationResult,
};
pub use event::{Event, EventKind, PropertyChange};
pub use index::{DomainIndex, InMemoryCache};
pub use migration::{MigrationCatalog, StreamMigration, StreamMigrationArgs, StreamMigrator};
pub use replay::{current_entity, EntityFold};
pub use resource::{EntityId, ResourceType, ResourceTypeRegistry};
pub use schema::{Entity, Field, Schema, MAX_NESTING_DEPTH};
pub use service::EventStoreService;
pub use stream::{EventStore, EventStream, MetadataValue, STREAM_VERSION_METADATA_KEY};
pub use subscription::{CatchUpSubscription, EventStreamEnumerator, ParseFailureHandler};
pub use transaction::EventStreamTransaction;
pub use types::{PropertyPath, ResourceTypeName, StreamName, Timestamp, UserId};

/// Commonly used items.
pub mod prelude {
    pub use crate::diff::{compare, create_entity, delete_entity};
    pub use crate::errors::{EntityError, EventStoreError, MigrationError};
    pub use crate::event::{Event, EventKind, PropertyChange};
    pub use crate::index::{DomainIndex, InMemoryCache};
    pub use crate::migration::{MigrationCatalog, StreamMigration, StreamMigrationArgs, StreamMigrator};
    pub use crate::replay::current_entity;
    pub use crate::resource::{EntityId, ResourceType, ResourceTypeRegistry};
    pub use crate::schema::{Entity, Field, Schema};
    pub use crate::stream::{EventStore, EventStream, MetadataValue};
    pub use crate::types::{StreamName, UserId};
}
