//! Entity replay engine: folds a stream into the current state of one entity.

use std::any;

use tracing::instrument;

use crate::errors::{EntityError, EntityResult};
use crate::event::{Event, EventKind};
use crate::resource::{ResourceType, ResourceTypeRegistry};
use crate::schema::{empty_instance, Entity};
use crate::stream::EventStream;
use crate::types::ResourceTypeName;

/// Fold state for one entity.
///
/// Events for other entities are ignored, as are property changes arriving
/// while the entity does not exist.
#[derive(Debug)]
pub struct EntityFold<T> {
    resource_type_name: ResourceTypeName,
    id: i32,
    current: Option<T>,
}

impl<T: Entity> EntityFold<T> {
    /// Starts folding for entity `id` of `resource_type`.
    pub fn new(resource_type: &ResourceType, id: i32) -> Self {
        Self {
            resource_type_name: resource_type.name().clone(),
            id,
            current: None,
        }
    }

    /// Applies one event.
    pub fn apply(&mut self, event: &Event) -> EntityResult<()> {
        if !event.concerns(&self.resource_type_name, self.id) {
            return Ok(());
        }

        match &event.kind {
            EventKind::Created => self.current = Some(empty_instance::<T>()?),
            EventKind::PropertyChanged(change) => {
                if let Some(current) = self.current.as_mut() {
                    change.apply_to(current)?;
                }
            }
            EventKind::Deleted => self.current = None,
        }
        Ok(())
    }

    /// The state folded so far.
    pub const fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    /// Finishes the fold.
    pub fn into_current(self) -> Option<T> {
        self.current
    }
}

/// Reconstructs entity `id` of `resource_type` by reading `stream` from the start.
///
/// Returns `None` if the entity was never created or was last deleted.
#[instrument(skip(stream, registry), fields(stream = %stream.name(), resource_type = %resource_type))]
pub async fn current_entity<T, S>(
    stream: &S,
    registry: &ResourceTypeRegistry,
    resource_type: &ResourceType,
    id: i32,
) -> EntityResult<Option<T>>
where
    T: Entity,
    S: EventStream + ?Sized,
{
    let registered = registry.try_parse(resource_type.name()).ok_or_else(|| {
        EntityError::ArgumentInvalid(format!(
            "no resource type named '{}' is registered",
            resource_type.name()
        ))
    })?;

    if !registered.runtime_type().is::<T>() {
        return Err(EntityError::TypeMismatch {
            resource_type: registered.name().to_string(),
            registered: registered.runtime_type().name(),
            requested: any::type_name::<T>(),
        });
    }

    let mut enumerator = stream.enumerator()?;
    let mut fold = EntityFold::<T>::new(&registered, id);
    while let Some(event) = enumerator.next().await? {
        fold.apply(&event)?;
    }
    Ok(fold.into_current())
}
