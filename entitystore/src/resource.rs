//! Resource types: named descriptors of the kinds of entity stored in a stream.
//!
//! Every event is tagged with the name of the resource type it concerns. The
//! mapping from names to Rust types lives in a [`ResourceTypeRegistry`] that the
//! hosting process (or test fixture) creates, passes around and tears down.

use std::any::{self, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::errors::ResourceTypeError;
use crate::types::ResourceTypeName;

/// Runtime descriptor of a Rust type.
#[derive(Debug, Clone, Copy)]
pub struct TypeDescriptor {
    id: TypeId,
    name: &'static str,
}

impl TypeDescriptor {
    /// Describes `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: any::type_name::<T>(),
        }
    }

    /// Whether this descriptor describes `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }

    /// The compiler-provided type name.
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeDescriptor {}

#[derive(Debug)]
struct ResourceTypeInner {
    name: ResourceTypeName,
    runtime_type: TypeDescriptor,
    base_type: Option<ResourceType>,
}

/// A registered kind of entity. Cheap to clone; equality and hashing use the name only.
#[derive(Debug, Clone)]
pub struct ResourceType(Arc<ResourceTypeInner>);

impl ResourceType {
    /// The registered name.
    pub fn name(&self) -> &ResourceTypeName {
        &self.0.name
    }

    /// The Rust type entities of this kind are materialized as.
    pub fn runtime_type(&self) -> TypeDescriptor {
        self.0.runtime_type
    }

    /// The optional base resource type.
    pub fn base_type(&self) -> Option<&Self> {
        self.0.base_type.as_ref()
    }
}

impl PartialEq for ResourceType {
    fn eq(&self, other: &Self) -> bool {
        self.0.name == other.0.name
    }
}

impl Eq for ResourceType {}

impl Hash for ResourceType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.name.hash(state);
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.name, f)
    }
}

/// Table of resource types keyed by name.
///
/// Registering a name twice replaces the earlier entry, which lets test
/// fixtures re-register freely.
#[derive(Debug, Default)]
pub struct ResourceTypeRegistry {
    types: RwLock<HashMap<ResourceTypeName, ResourceType>>,
}

impl ResourceTypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `name`, optionally deriving from `base`.
    pub fn register<T: 'static>(
        &self,
        name: &str,
        base: Option<&ResourceType>,
    ) -> Result<ResourceType, ResourceTypeError> {
        let name = ResourceTypeName::try_new(name)
            .map_err(|error| ResourceTypeError::InvalidName(error.to_string()))?;

        let resource_type = ResourceType(Arc::new(ResourceTypeInner {
            name: name.clone(),
            runtime_type: TypeDescriptor::of::<T>(),
            base_type: base.cloned(),
        }));

        if self
            .types
            .write()
            .insert(name.clone(), resource_type.clone())
            .is_some()
        {
            debug!(resource_type = %name, "replaced existing resource type registration");
        }

        Ok(resource_type)
    }

    /// Looks up the resource type registered under `name`.
    pub fn parse(&self, name: &str) -> Result<ResourceType, ResourceTypeError> {
        self.try_parse(name)
            .ok_or_else(|| ResourceTypeError::Unknown {
                name: name.to_string(),
            })
    }

    /// Looks up the resource type registered under `name`, if any.
    pub fn try_parse(&self, name: &str) -> Option<ResourceType> {
        let name = ResourceTypeName::try_new(name).ok()?;
        self.types.read().get(&name).cloned()
    }

    /// Whether `resource_type` is the registration currently held under its name.
    pub fn contains(&self, resource_type: &ResourceType) -> bool {
        self.types
            .read()
            .get(resource_type.name())
            .is_some_and(|registered| Arc::ptr_eq(&registered.0, &resource_type.0))
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<ResourceTypeName> {
        let mut names: Vec<_> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Removes every registration.
    pub fn clear(&self) {
        self.types.write().clear();
    }
}

/// Identifies one entity instance across its whole lifetime, including
/// delete/recreate cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId {
    /// The kind of entity.
    pub resource_type: ResourceType,
    /// The numeric identifier within the resource type.
    pub id: i32,
}

impl EntityId {
    /// Creates an entity id.
    pub const fn new(resource_type: ResourceType, id: i32) -> Self {
        Self { resource_type, id }
    }
}

impl From<(ResourceType, i32)> for EntityId {
    fn from((resource_type, id): (ResourceType, i32)) -> Self {
        Self::new(resource_type, id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.resource_type, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Exhibit;
    struct Route;

    #[test]
    fn registered_types_can_be_parsed_by_name() {
        let registry = ResourceTypeRegistry::new();
        let exhibit = registry.register::<Exhibit>("Exhibit", None).unwrap();

        let parsed = registry.parse("Exhibit").unwrap();

        assert_eq!(parsed, exhibit);
        assert!(parsed.runtime_type().is::<Exhibit>());
        assert!(registry.contains(&parsed));
    }

    #[test]
    fn unknown_names_fail_to_parse() {
        let registry = ResourceTypeRegistry::new();

        assert!(registry.try_parse("Route").is_none());
        assert_eq!(
            registry.parse("Route"),
            Err(ResourceTypeError::Unknown {
                name: "Route".to_string()
            })
        );
    }

    #[test]
    fn empty_names_are_rejected() {
        let registry = ResourceTypeRegistry::new();
        assert!(matches!(
            registry.register::<Exhibit>("  ", None),
            Err(ResourceTypeError::InvalidName(_))
        ));
    }

    #[test]
    fn re_registration_replaces_the_entry() {
        let registry = ResourceTypeRegistry::new();
        let first = registry.register::<Exhibit>("Thing", None).unwrap();
        let second = registry.register::<Route>("Thing", None).unwrap();

        // Equality is by name, so both handles compare equal
        assert_eq!(first, second);
        assert!(!registry.contains(&first));
        assert!(registry.parse("Thing").unwrap().runtime_type().is::<Route>());
    }

    #[test]
    fn base_types_are_retained() {
        let registry = ResourceTypeRegistry::new();
        let base = registry.register::<Exhibit>("Exhibit", None).unwrap();
        let derived = registry.register::<Route>("Route", Some(&base)).unwrap();

        assert_eq!(derived.base_type(), Some(&base));
        assert_eq!(registry.names().len(), 2);

        registry.clear();
        assert!(registry.names().is_empty());
    }

    #[test]
    fn entity_id_displays_type_and_number() {
        let registry = ResourceTypeRegistry::new();
        let exhibit = registry.register::<Exhibit>("Exhibit", None).unwrap();

        let id = EntityId::from((exhibit.clone(), 7));

        assert_eq!(id.to_string(), "Exhibit 7");
        assert_eq!(id, EntityId::new(exhibit, 7));
    }
}
