//! Procedural macros for the entitystore library.
//!
//! This crate provides the `Entity` derive, which generates the field schema
//! the diff and replay engines walk.

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod entity;
mod utils;

use entity::expand_derive_entity;

/// Derive macro for implementing the `Entity` trait.
///
/// Every named field becomes a schema entry in declaration order. `String`,
/// `Vec<_>` and `VecDeque<_>` fields are treated as sequences; everything
/// else is a scalar compared by equality. Nested entities must be marked.
///
/// # Example
///
/// ```ignore
/// use entitystore_macros::Entity;
///
/// #[derive(Default, Entity)]
/// struct Address {
///     #[entity(rename = "City")]
///     city: String,
/// }
///
/// #[derive(Default, Entity)]
/// struct Customer {
///     #[entity(rename = "Name")]
///     name: String,
///     #[entity(rename = "Address", nested)]
///     address: Option<Address>,
///     #[entity(skip)]
///     cached_score: u32,
/// }
/// ```
///
/// Field attributes:
/// - `rename = "..."`: the property name used in events
/// - `skip`: leave the field out of the schema
/// - `scalar`, `sequence`: override the detected kind
/// - `nested`: the field is `Option<T>` or `Option<Box<T>>` where `T: Entity`
///
/// Container attributes:
/// - `no_default`: `empty()` returns `None`, so the type cannot be created
///   by replay or used as a nested default
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    expand_derive_entity(input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}
