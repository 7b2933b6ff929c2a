//! The canonical event model.
//!
//! Every change to an entity is expressed with one of three event kinds:
//! [`EventKind::Created`], [`EventKind::PropertyChanged`] and
//! [`EventKind::Deleted`]. All of them carry the resource type name, entity id,
//! user id and timestamp.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EntityResult;
use crate::resource::{EntityId, ResourceType};
use crate::schema::{self, Entity};
use crate::types::{PropertyPath, ResourceTypeName, Timestamp, UserId};

/// A change to one leaf field of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    /// Dot-separated path of the changed field.
    pub property_path: PropertyPath,
    /// The new value. `Value::Null` means the field became absent.
    pub value: Value,
    /// Name of the field's Rust type.
    pub value_type_name: String,
}

impl PropertyChange {
    /// Sets the addressed field of `entity` to this change's value.
    ///
    /// Missing nested objects along the path are materialized. Unknown
    /// properties and values that do not fit the field are skipped.
    pub fn apply_to<T: Entity>(&self, entity: &mut T) -> EntityResult<()> {
        schema::apply_property(entity, &self.property_path, &self.value)
    }
}

/// The kind of an event, and its kind-specific data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// The entity begins to exist.
    Created,
    /// One leaf field changed.
    PropertyChanged(PropertyChange),
    /// The entity ceases to exist. A later `Created` may resurrect it.
    Deleted,
}

/// An event concerning one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Name of the resource type of the entity.
    pub resource_type_name: ResourceTypeName,
    /// Id of the entity within its resource type.
    pub entity_id: i32,
    /// The user that caused the event.
    pub user_id: UserId,
    /// When the event was created.
    pub timestamp: Timestamp,
    /// What happened.
    pub kind: EventKind,
}

impl Event {
    fn new(resource_type: &ResourceType, entity_id: i32, user_id: UserId, kind: EventKind) -> Self {
        Self {
            resource_type_name: resource_type.name().clone(),
            entity_id,
            user_id,
            timestamp: Timestamp::now(),
            kind,
        }
    }

    /// A `Created` event.
    pub fn created(resource_type: &ResourceType, entity_id: i32, user_id: impl Into<UserId>) -> Self {
        Self::new(resource_type, entity_id, user_id.into(), EventKind::Created)
    }

    /// A `PropertyChanged` event.
    pub fn property_changed(
        resource_type: &ResourceType,
        entity_id: i32,
        user_id: impl Into<UserId>,
        change: PropertyChange,
    ) -> Self {
        Self::new(
            resource_type,
            entity_id,
            user_id.into(),
            EventKind::PropertyChanged(change),
        )
    }

    /// A `Deleted` event.
    pub fn deleted(resource_type: &ResourceType, entity_id: i32, user_id: impl Into<UserId>) -> Self {
        Self::new(resource_type, entity_id, user_id.into(), EventKind::Deleted)
    }

    /// Whether the event concerns the given entity.
    pub fn concerns(&self, resource_type_name: &ResourceTypeName, entity_id: i32) -> bool {
        self.entity_id == entity_id && &self.resource_type_name == resource_type_name
    }

    /// Whether the event concerns `entity`.
    pub fn concerns_entity(&self, entity: &EntityId) -> bool {
        self.concerns(entity.resource_type.name(), entity.id)
    }

    /// Short name of the event kind, used in logs.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            EventKind::Created => "Created",
            EventKind::PropertyChanged(_) => "PropertyChanged",
            EventKind::Deleted => "Deleted",
        }
    }

    /// The property change carried by a `PropertyChanged` event.
    pub fn property_change(&self) -> Option<&PropertyChange> {
        match &self.kind {
            EventKind::PropertyChanged(change) => Some(change),
            _ => None,
        }
    }
}
