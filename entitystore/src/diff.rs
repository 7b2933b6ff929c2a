//! Entity diff engine.
//!
//! Compares two snapshots of an entity field by field, in declaration order,
//! and emits one `PropertyChanged` event per leaf that differs:
//!
//! - fields absent on both sides are skipped;
//! - sequence fields emit the whole new value when either side is absent or the
//!   elements differ;
//! - nested fields recurse with dot-joined paths, starting from an empty
//!   instance when the old side is absent, and emit a single null change when
//!   the new side is absent;
//! - a nested object that appears without any leaf differing from an empty
//!   instance emits one change carrying an empty JSON object, so replay
//!   materializes it;
//! - scalar fields emit when the values differ.
//!
//! Creating an entity is expressed with the same machinery: a `Created` event
//! followed by the diff from an empty instance, in a mode that emits every
//! present leaf.

use std::any;

use crate::errors::{EntityError, EntityResult};
use crate::event::{Event, PropertyChange};
use crate::resource::ResourceType;
use crate::schema::{empty_instance, Entity, FieldShape};
use crate::types::{PropertyPath, UserId};

/// Whether a diff describes an update or the creation of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMode {
    /// Emit changed leaves only.
    Update,
    /// Emit every present leaf, even when it equals the empty baseline.
    Create,
}

pub(crate) fn diff_fields<T: Entity>(
    old: &T,
    new: &T,
    parent: Option<&PropertyPath>,
    depth: usize,
    mode: DiffMode,
    out: &mut Vec<PropertyChange>,
) -> EntityResult<()> {
    let schema = T::schema();

    for field in schema.fields() {
        let path = PropertyPath::join(parent, field.name());

        let leaf = match field.shape() {
            FieldShape::Nested(nested) => {
                nested.diff(old, new, &path, depth, mode, out)?;
                continue;
            }
            FieldShape::Scalar(leaf) | FieldShape::Sequence(leaf) => leaf,
        };

        let serialization_error = |error: serde_json::Error| EntityError::Serialization {
            path: path.to_string(),
            detail: error.to_string(),
        };
        let old_value = leaf.read(old).map_err(serialization_error)?;
        let new_value = leaf.read(new).map_err(serialization_error)?;

        if old_value.is_null() && new_value.is_null() {
            continue;
        }

        let differs = match field.shape() {
            FieldShape::Sequence(_) => {
                old_value.is_null() || new_value.is_null() || !leaf.equals(old, new)
            }
            _ => !leaf.equals(old, new),
        };
        let created = mode == DiffMode::Create && !new_value.is_null();

        if differs || created {
            out.push(PropertyChange {
                property_path: path,
                value: new_value,
                value_type_name: leaf.value_type_name().to_string(),
            });
        }
    }

    Ok(())
}

fn ensure_registered_type<T: Entity>(resource_type: &ResourceType) -> EntityResult<()> {
    if resource_type.runtime_type().is::<T>() {
        Ok(())
    } else {
        Err(EntityError::TypeMismatch {
            resource_type: resource_type.name().to_string(),
            registered: resource_type.runtime_type().name(),
            requested: any::type_name::<T>(),
        })
    }
}

/// The leaf changes between `old` and `new`, in declaration order.
pub fn property_changes<T: Entity>(
    old: &T,
    new: &T,
    mode: DiffMode,
) -> EntityResult<Vec<PropertyChange>> {
    let mut changes = Vec::new();
    diff_fields(old, new, None, 1, mode, &mut changes)?;
    Ok(changes)
}

/// `PropertyChanged` events turning `old` into `new`.
pub fn compare<T: Entity>(
    old: &T,
    new: &T,
    resource_type: &ResourceType,
    id: i32,
    user_id: impl Into<UserId>,
) -> EntityResult<Vec<Event>> {
    ensure_registered_type::<T>(resource_type)?;
    let user_id = user_id.into();

    Ok(property_changes(old, new, DiffMode::Update)?
        .into_iter()
        .map(|change| Event::property_changed(resource_type, id, user_id.clone(), change))
        .collect())
}

/// `Created` followed by one `PropertyChanged` per present leaf of `entity`.
pub fn create_entity<T: Entity>(
    entity: &T,
    resource_type: &ResourceType,
    id: i32,
    user_id: impl Into<UserId>,
) -> EntityResult<Vec<Event>> {
    ensure_registered_type::<T>(resource_type)?;
    let user_id = user_id.into();
    let empty = empty_instance::<T>()?;

    let mut events = vec![Event::created(resource_type, id, user_id.clone())];
    events.extend(
        property_changes(&empty, entity, DiffMode::Create)?
            .into_iter()
            .map(|change| Event::property_changed(resource_type, id, user_id.clone(), change)),
    );
    Ok(events)
}

/// The `Deleted` event for an entity.
pub fn delete_entity(resource_type: &ResourceType, id: i32, user_id: impl Into<UserId>) -> Event {
    Event::deleted(resource_type, id, user_id)
}
