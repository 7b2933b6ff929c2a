//! Attribute parsing and type inspection for the entity derive.

use std::collections::HashSet;

use syn::{
    Attribute, Data, DeriveInput, Error, Fields, GenericArgument, Ident, LitStr, PathArguments,
    PathSegment, Result, Type, TypePath,
};

/// Path separator of property names; renamed fields may not contain it.
const PATH_SEPARATOR: char = '.';

/// How a field is diffed and replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    Sequence,
    /// `Option<Target>`, or `Option<Box<Target>>` when `boxed`.
    Nested { target: Box<Type>, boxed: bool },
}

/// A struct field that takes part in the schema.
#[derive(Debug, Clone)]
pub struct EntityField {
    pub ident: Ident,
    pub name: String,
    pub ty: Type,
    pub kind: FieldKind,
}

/// Options given on the struct itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ContainerOptions {
    /// `empty()` returns `None` instead of `Default::default()`.
    pub no_default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KindOverride {
    Scalar,
    Sequence,
    Nested,
}

#[derive(Debug, Default)]
struct FieldOptions {
    rename: Option<LitStr>,
    skip: bool,
    kind: Option<KindOverride>,
}

fn is_entity_attribute(attr: &Attribute) -> bool {
    attr.path().is_ident("entity")
}

/// Parse `#[entity(...)]` options on the struct.
pub fn parse_container_options(attrs: &[Attribute]) -> Result<ContainerOptions> {
    let mut options = ContainerOptions::default();
    for attr in attrs.iter().filter(|attr| is_entity_attribute(attr)) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("no_default") {
                options.no_default = true;
                Ok(())
            } else {
                Err(meta.error("unsupported entity container attribute, expected `no_default`"))
            }
        })?;
    }
    Ok(options)
}

fn parse_field_options(attrs: &[Attribute]) -> Result<FieldOptions> {
    let mut options = FieldOptions::default();
    for attr in attrs.iter().filter(|attr| is_entity_attribute(attr)) {
        attr.parse_nested_meta(|meta| {
            let kind = if meta.path.is_ident("rename") {
                options.rename = Some(meta.value()?.parse()?);
                return Ok(());
            } else if meta.path.is_ident("skip") {
                options.skip = true;
                return Ok(());
            } else if meta.path.is_ident("scalar") {
                KindOverride::Scalar
            } else if meta.path.is_ident("sequence") {
                KindOverride::Sequence
            } else if meta.path.is_ident("nested") {
                KindOverride::Nested
            } else {
                return Err(meta.error(
                    "unsupported entity field attribute, expected one of \
                     `rename`, `skip`, `scalar`, `sequence`, `nested`",
                ));
            };

            if options.kind.is_some_and(|existing| existing != kind) {
                return Err(meta.error("a field can only be one of `scalar`, `sequence`, `nested`"));
            }
            options.kind = Some(kind);
            Ok(())
        })?;
    }
    Ok(options)
}

fn last_segment(ty: &Type) -> Option<&PathSegment> {
    match ty {
        Type::Path(TypePath { qself: None, path }) => path.segments.last(),
        _ => None,
    }
}

fn single_type_argument(segment: &PathSegment) -> Option<&Type> {
    let PathArguments::AngleBracketed(arguments) = &segment.arguments else {
        return None;
    };
    let mut types = arguments.args.iter().filter_map(|argument| match argument {
        GenericArgument::Type(ty) => Some(ty),
        _ => None,
    });
    match (types.next(), types.next()) {
        (Some(ty), None) => Some(ty),
        _ => None,
    }
}

fn wrapped_in<'a>(ty: &'a Type, wrapper: &str) -> Option<&'a Type> {
    last_segment(ty)
        .filter(|segment| segment.ident == wrapper)
        .and_then(single_type_argument)
}

/// Text and growable collections are sequences unless told otherwise.
pub fn is_sequence_type(ty: &Type) -> bool {
    last_segment(ty).is_some_and(|segment| {
        ["String", "Vec", "VecDeque"]
            .iter()
            .any(|name| segment.ident == name)
    })
}

/// The nested entity type of `Option<T>` or `Option<Box<T>>`.
pub fn nested_target(ty: &Type) -> Option<(Type, bool)> {
    let inner = wrapped_in(ty, "Option")?;
    Some(match wrapped_in(inner, "Box") {
        Some(target) => (target.clone(), true),
        None => (inner.clone(), false),
    })
}

fn field_name(ident: &Ident, rename: Option<&LitStr>) -> Result<String> {
    let Some(rename) = rename else {
        return Ok(ident.to_string());
    };
    let name = rename.value();
    if name.trim().is_empty() {
        return Err(Error::new_spanned(rename, "entity field names must not be empty"));
    }
    if name.contains(PATH_SEPARATOR) {
        return Err(Error::new_spanned(
            rename,
            format!("entity field names must not contain `{PATH_SEPARATOR}`"),
        ));
    }
    Ok(name)
}

fn field_kind(field: &syn::Field, kind: Option<KindOverride>) -> Result<FieldKind> {
    match kind {
        Some(KindOverride::Nested) => {
            let (target, boxed) = nested_target(&field.ty).ok_or_else(|| {
                Error::new_spanned(
                    &field.ty,
                    "nested entity fields must be `Option<T>` or `Option<Box<T>>`",
                )
            })?;
            Ok(FieldKind::Nested {
                target: Box::new(target),
                boxed,
            })
        }
        Some(KindOverride::Sequence) => Ok(FieldKind::Sequence),
        Some(KindOverride::Scalar) => Ok(FieldKind::Scalar),
        None if is_sequence_type(&field.ty) => Ok(FieldKind::Sequence),
        None => Ok(FieldKind::Scalar),
    }
}

/// Extract the schema fields of a struct, in declaration order.
pub fn extract_entity_fields(input: &DeriveInput) -> Result<Vec<EntityField>> {
    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(Error::new_spanned(
                    input,
                    "Entity derive only supports structs with named fields",
                ))
            }
        },
        _ => {
            return Err(Error::new_spanned(
                input,
                "Entity derive only supports structs",
            ))
        }
    };

    let mut seen = HashSet::new();
    let mut entity_fields = Vec::new();

    for field in fields {
        let options = parse_field_options(&field.attrs)?;
        if options.skip {
            continue;
        }

        let ident = field
            .ident
            .clone()
            .ok_or_else(|| Error::new_spanned(field, "Field must have a name"))?;
        let name = field_name(&ident, options.rename.as_ref())?;
        if !seen.insert(name.clone()) {
            return Err(Error::new_spanned(
                field,
                format!("duplicate entity field name `{name}`"),
            ));
        }

        entity_fields.push(EntityField {
            kind: field_kind(field, options.kind)?,
            ident,
            name,
            ty: field.ty.clone(),
        });
    }

    Ok(entity_fields)
}
