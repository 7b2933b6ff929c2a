//! Field schemas: the per-type table the diff and replay engines walk.
//!
//! An [`Entity`] describes its fields in declaration order. Each field is a
//! scalar, a sequence (text, vectors) or a nested entity whose own fields are
//! diffed and replayed individually. The table is usually generated by
//! `#[derive(Entity)]`, but writing it by hand is straightforward:
//!
//! ```
//! use entitystore::schema::{Entity, Field, Schema};
//!
//! #[derive(Default)]
//! struct Widget {
//!     name: String,
//!     count: i32,
//! }
//!
//! impl Entity for Widget {
//!     fn schema() -> Schema<Self> {
//!         Schema::new(vec![
//!             Field::<Self>::sequence("Name", |w| &w.name, |w| &mut w.name),
//!             Field::<Self>::scalar("Count", |w| &w.count, |w| &mut w.count),
//!         ])
//!     }
//!
//!     fn empty() -> Option<Self> {
//!         Some(Self::default())
//!     }
//! }
//! ```

use std::any;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::diff::{diff_fields, DiffMode};
use crate::errors::{EntityError, EntityResult};
use crate::event::PropertyChange;
use crate::types::PropertyPath;

/// Depth at which nested-object recursion is treated as a cycle.
pub const MAX_NESTING_DEPTH: usize = 50;

/// A type whose state is stored as events.
pub trait Entity: Send + Sync + Sized + 'static {
    /// The field table, in declaration order.
    fn schema() -> Schema<Self>;

    /// A fresh, empty instance, or `None` if the type cannot be
    /// default-constructed.
    fn empty() -> Option<Self>;
}

/// Returns `N::empty()` or a `MissingEmptyConstructor` error.
pub fn empty_instance<N: Entity>() -> EntityResult<N> {
    N::empty().ok_or(EntityError::MissingEmptyConstructor {
        type_name: any::type_name::<N>(),
    })
}

/// Values that can be stored in scalar and sequence fields.
pub trait FieldValue: Serialize + DeserializeOwned + PartialEq + Send + Sync + 'static {}

impl<V> FieldValue for V where V: Serialize + DeserializeOwned + PartialEq + Send + Sync + 'static {}

/// Ordered field table of an entity type.
pub struct Schema<T: 'static> {
    fields: Vec<Field<T>>,
}

impl<T: 'static> Schema<T> {
    /// Creates a schema from fields in declaration order.
    pub fn new(fields: Vec<Field<T>>) -> Self {
        Self { fields }
    }

    /// The fields in declaration order.
    pub fn fields(&self) -> &[Field<T>] {
        &self.fields
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&Field<T>> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// One entry of a [`Schema`].
pub struct Field<T: 'static> {
    name: &'static str,
    shape: FieldShape<T>,
}

pub(crate) enum FieldShape<T: 'static> {
    Scalar(Box<dyn LeafAccess<T>>),
    Sequence(Box<dyn LeafAccess<T>>),
    Nested(Box<dyn NestedAccess<T>>),
}

impl<T: 'static> Field<T> {
    /// A field compared by value equality.
    pub fn scalar<V: FieldValue>(
        name: &'static str,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) -> Self {
        Self {
            name,
            shape: FieldShape::Scalar(Box::new(Leaf { get, get_mut })),
        }
    }

    /// A sequence field (text, vectors). Any difference replaces the whole value.
    pub fn sequence<V: FieldValue>(
        name: &'static str,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) -> Self {
        Self {
            name,
            shape: FieldShape::Sequence(Box::new(Leaf { get, get_mut })),
        }
    }

    /// A nested entity held in an `Option`.
    pub fn nested<N: Entity>(
        name: &'static str,
        get: fn(&T) -> &Option<N>,
        get_mut: fn(&mut T) -> &mut Option<N>,
    ) -> Self {
        Self::nested_in_slot::<N, Option<N>>(name, get, get_mut)
    }

    /// A nested entity held in an `Option<Box<_>>`, for recursive types.
    pub fn nested_boxed<N: Entity>(
        name: &'static str,
        get: fn(&T) -> &Option<Box<N>>,
        get_mut: fn(&mut T) -> &mut Option<Box<N>>,
    ) -> Self {
        Self::nested_in_slot::<N, Option<Box<N>>>(name, get, get_mut)
    }

    fn nested_in_slot<N: Entity, S: NestedSlot<N>>(
        name: &'static str,
        get: fn(&T) -> &S,
        get_mut: fn(&mut T) -> &mut S,
    ) -> Self {
        Self {
            name,
            shape: FieldShape::Nested(Box::new(Nested::<T, N, S> {
                get,
                get_mut,
                target: PhantomData,
            })),
        }
    }

    /// The field name used in property paths.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the field is a nested entity.
    pub const fn is_nested(&self) -> bool {
        matches!(self.shape, FieldShape::Nested(_))
    }

    /// Whether the field is a sequence.
    pub const fn is_sequence(&self) -> bool {
        matches!(self.shape, FieldShape::Sequence(_))
    }

    pub(crate) const fn shape(&self) -> &FieldShape<T> {
        &self.shape
    }
}

pub(crate) trait LeafAccess<T>: Send + Sync {
    fn read(&self, entity: &T) -> Result<Value, serde_json::Error>;
    fn equals(&self, left: &T, right: &T) -> bool;
    fn write(&self, entity: &mut T, value: &Value) -> Result<(), serde_json::Error>;
    fn value_type_name(&self) -> &'static str;
}

struct Leaf<T, V> {
    get: fn(&T) -> &V,
    get_mut: fn(&mut T) -> &mut V,
}

impl<T: 'static, V: FieldValue> LeafAccess<T> for Leaf<T, V> {
    fn read(&self, entity: &T) -> Result<Value, serde_json::Error> {
        serde_json::to_value((self.get)(entity))
    }

    fn equals(&self, left: &T, right: &T) -> bool {
        (self.get)(left) == (self.get)(right)
    }

    fn write(&self, entity: &mut T, value: &Value) -> Result<(), serde_json::Error> {
        *(self.get_mut)(entity) = V::deserialize(value)?;
        Ok(())
    }

    fn value_type_name(&self) -> &'static str {
        any::type_name::<V>()
    }
}

/// Storage of a nested entity: `Option<N>` or `Option<Box<N>>`.
pub trait NestedSlot<N: Entity>: Send + Sync + 'static {
    /// The nested entity, if present.
    fn get(&self) -> Option<&N>;

    /// The nested entity, materializing an empty one if absent.
    fn get_or_insert_empty(&mut self) -> EntityResult<&mut N>;

    /// Makes the slot absent.
    fn clear(&mut self);
}

impl<N: Entity> NestedSlot<N> for Option<N> {
    fn get(&self) -> Option<&N> {
        self.as_ref()
    }

    fn get_or_insert_empty(&mut self) -> EntityResult<&mut N> {
        if self.is_none() {
            *self = Some(empty_instance::<N>()?);
        }
        self.as_mut().ok_or(EntityError::MissingEmptyConstructor {
            type_name: any::type_name::<N>(),
        })
    }

    fn clear(&mut self) {
        *self = None;
    }
}

impl<N: Entity> NestedSlot<N> for Option<Box<N>> {
    fn get(&self) -> Option<&N> {
        self.as_deref()
    }

    fn get_or_insert_empty(&mut self) -> EntityResult<&mut N> {
        if self.is_none() {
            *self = Some(Box::new(empty_instance::<N>()?));
        }
        self.as_deref_mut().ok_or(EntityError::MissingEmptyConstructor {
            type_name: any::type_name::<N>(),
        })
    }

    fn clear(&mut self) {
        *self = None;
    }
}

pub(crate) trait NestedAccess<T>: Send + Sync {
    fn diff(
        &self,
        old: &T,
        new: &T,
        path: &PropertyPath,
        depth: usize,
        mode: DiffMode,
        out: &mut Vec<PropertyChange>,
    ) -> EntityResult<()>;

    fn apply(
        &self,
        entity: &mut T,
        rest: &[&str],
        value: &Value,
        full_path: &PropertyPath,
    ) -> EntityResult<()>;
}

struct Nested<T, N, S> {
    get: fn(&T) -> &S,
    get_mut: fn(&mut T) -> &mut S,
    target: PhantomData<fn() -> N>,
}

impl<T: 'static, N: Entity, S: NestedSlot<N>> NestedAccess<T> for Nested<T, N, S> {
    fn diff(
        &self,
        old: &T,
        new: &T,
        path: &PropertyPath,
        depth: usize,
        mode: DiffMode,
        out: &mut Vec<PropertyChange>,
    ) -> EntityResult<()> {
        let old = (self.get)(old).get();
        let new = (self.get)(new).get();

        if old.is_none() && new.is_none() {
            return Ok(());
        }

        if depth >= MAX_NESTING_DEPTH {
            return Err(EntityError::CyclicGraph {
                path: path.to_string(),
                depth,
            });
        }

        let Some(new) = new else {
            out.push(PropertyChange {
                property_path: path.clone(),
                value: Value::Null,
                value_type_name: any::type_name::<N>().to_string(),
            });
            return Ok(());
        };

        let Some(old) = old else {
            let empty = empty_instance::<N>()?;
            let before = out.len();
            diff_fields(&empty, new, Some(path), depth + 1, mode, out)?;
            // Nothing below differs from an empty instance: record the presence
            if out.len() == before {
                out.push(PropertyChange {
                    property_path: path.clone(),
                    value: Value::Object(serde_json::Map::new()),
                    value_type_name: any::type_name::<N>().to_string(),
                });
            }
            return Ok(());
        };

        diff_fields(old, new, Some(path), depth + 1, mode, out)
    }

    fn apply(
        &self,
        entity: &mut T,
        rest: &[&str],
        value: &Value,
        full_path: &PropertyPath,
    ) -> EntityResult<()> {
        let slot = (self.get_mut)(entity);

        if rest.is_empty() {
            if value.is_null() {
                slot.clear();
            } else if value.is_object() {
                let _ = slot.get_or_insert_empty()?;
            } else {
                warn!(property = %full_path, "skipping non-object value assigned to a nested object");
            }
            return Ok(());
        }

        apply_segments(slot.get_or_insert_empty()?, rest, value, full_path)
    }
}

/// Sets the field addressed by `path` to `value`.
///
/// Absent nested objects along the path are materialized. Unknown properties
/// are ignored and values that do not fit the field are skipped with a warning.
pub fn apply_property<T: Entity>(
    entity: &mut T,
    path: &PropertyPath,
    value: &Value,
) -> EntityResult<()> {
    let segments: Vec<&str> = path.segments().collect();
    apply_segments(entity, &segments, value, path)
}

fn apply_segments<T: Entity>(
    entity: &mut T,
    segments: &[&str],
    value: &Value,
    full_path: &PropertyPath,
) -> EntityResult<()> {
    let Some((name, rest)) = segments.split_first() else {
        return Ok(());
    };

    let schema = T::schema();
    let Some(field) = schema.field(name) else {
        debug!(property = %full_path, "ignoring change to unknown property");
        return Ok(());
    };

    match field.shape() {
        FieldShape::Scalar(leaf) | FieldShape::Sequence(leaf) => {
            if !rest.is_empty() {
                debug!(property = %full_path, "ignoring path through a non-nested property");
                return Ok(());
            }
            if let Err(error) = leaf.write(entity, value) {
                warn!(
                    property = %full_path,
                    expected = leaf.value_type_name(),
                    %error,
                    "skipping value that does not fit the property"
                );
            }
            Ok(())
        }
        FieldShape::Nested(nested) => nested.apply(entity, rest, value, full_path),
    }
}
