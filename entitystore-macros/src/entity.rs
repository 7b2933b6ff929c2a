//! Implementation of the #[derive(Entity)] procedural macro.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{DeriveInput, Result};

use crate::utils::{extract_entity_fields, parse_container_options, EntityField, FieldKind};

/// Expands the #[derive(Entity)] macro.
pub fn expand_derive_entity(input: DeriveInput) -> Result<TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let options = parse_container_options(&input.attrs)?;
    let fields = extract_entity_fields(&input)?;
    let entries = fields.iter().map(generate_field);

    let empty = if options.no_default {
        quote! { ::core::option::Option::None }
    } else {
        quote! { ::core::option::Option::Some(::core::default::Default::default()) }
    };

    Ok(quote! {
        impl #impl_generics ::entitystore::schema::Entity for #name #ty_generics #where_clause {
            fn schema() -> ::entitystore::schema::Schema<Self> {
                ::entitystore::schema::Schema::new(::std::vec![#(#entries),*])
            }

            fn empty() -> ::core::option::Option<Self> {
                #empty
            }
        }
    })
}

/// Generate one `Field` constructor call.
fn generate_field(field: &EntityField) -> TokenStream {
    let ident = &field.ident;
    let name = &field.name;
    let ty = &field.ty;
    let accessors = quote! {
        |entity| &entity.#ident,
        |entity| &mut entity.#ident
    };

    match &field.kind {
        FieldKind::Scalar => quote! {
            ::entitystore::schema::Field::<Self>::scalar::<#ty>(#name, #accessors)
        },
        FieldKind::Sequence => quote! {
            ::entitystore::schema::Field::<Self>::sequence::<#ty>(#name, #accessors)
        },
        FieldKind::Nested {
            target,
            boxed: false,
        } => quote! {
            ::entitystore::schema::Field::<Self>::nested::<#target>(#name, #accessors)
        },
        FieldKind::Nested {
            target,
            boxed: true,
        } => quote! {
            ::entitystore::schema::Field::<Self>::nested_boxed::<#target>(#name, #accessors)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn test_expand_derive_entity_with_fields() {
        let input: DeriveInput = parse_quote! {
            #[derive(Entity)]
            struct Widget {
                #[entity(rename = "Name")]
                name: String,
                count: i32,
                #[entity(nested)]
                owner: Option<Owner>,
                #[entity(nested)]
                parent: Option<Box<Widget>>,
            }
        };

        let output = expand_derive_entity(input).unwrap().to_string();

        assert!(output.contains("impl :: entitystore :: schema :: Entity for Widget"));
        assert!(output.contains("sequence :: < String > (\"Name\""));
        assert!(output.contains("scalar :: < i32 > (\"count\""));
        assert!(output.contains("nested :: < Owner > (\"owner\""));
        assert!(output.contains("nested_boxed :: < Widget > (\"parent\""));
        assert!(output.contains("Default :: default ()"));
    }

    #[test]
    fn test_expand_derive_entity_without_default() {
        let input: DeriveInput = parse_quote! {
            #[entity(no_default)]
            struct Handle {
                id: i64,
            }
        };

        let output = expand_derive_entity(input).unwrap().to_string();

        assert!(output.contains("Option :: None"));
        assert!(!output.contains("Default :: default"));
    }

    #[test]
    fn test_expand_derive_entity_keeps_generics() {
        let input: DeriveInput = parse_quote! {
            struct Tagged<T: Send> where T: Sync {
                value: T,
            }
        };

        let output = expand_derive_entity(input).unwrap().to_string();

        assert!(output.contains("for Tagged < T >"));
        assert!(output.contains("where T : Sync"));
    }

    #[test]
    fn test_expand_derive_entity_reports_errors() {
        let input: DeriveInput = parse_quote! {
            struct Widget {
                #[entity(nested)]
                owner: Owner,
            }
        };

        assert!(expand_derive_entity(input).is_err());
    }
}
