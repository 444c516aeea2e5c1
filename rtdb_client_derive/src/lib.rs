//! `#[derive(Row)]`: generates an `rtdb_client::Row` impl for a plain
//! struct, bridging it to the wire codec's `AlgebraicType`/`AlgebraicValue`
//! tree without hand-written per-field boilerplate (spec §3's `TableRow`).
//!
//! Structurally this mirrors `examples/Protryon-klickhouse/klickhouse_derive`
//! -- same `syn`/`quote` dependency pair, same per-field attribute-walk
//! shape -- narrowed from klickhouse's SQL column set (rename-all rules,
//! nested/flattened
//! sub-rows, `Option<Type>` column hints) to the one thing this crate's
//! rows need: a primary key index and optional secondary unique indexes
//! (spec §4.7), since there is no SQL column binding to reconcile here.

mod attr;
mod symbol;

use attr::FieldAttrs;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

#[proc_macro_derive(Row, attributes(rtdb))]
pub fn derive_row(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input).unwrap_or_else(|e| e.to_compile_error()).into()
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream2> {
    let ident = &input.ident;
    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            Fields::Unnamed(_) => {
                return Err(syn::Error::new_spanned(&input, "Row does not support tuple structs"))
            }
            Fields::Unit => return Err(syn::Error::new_spanned(&input, "Row does not support unit structs")),
        },
        Data::Enum(_) => return Err(syn::Error::new_spanned(&input, "Row does not support enums")),
        Data::Union(_) => return Err(syn::Error::new_spanned(&input, "Row does not support unions")),
    };

    let mut names = Vec::with_capacity(fields.len());
    let mut tys = Vec::with_capacity(fields.len());
    let mut parsed_attrs = Vec::with_capacity(fields.len());
    for field in fields {
        let field_ident = field.ident.clone().expect("named fields checked above");
        let attrs = FieldAttrs::from_ast(field)?;
        names.push(field_ident.clone());
        tys.push(field.ty.clone());
        parsed_attrs.push((field_ident, attrs));
    }
    attr::check_primary_keys(&parsed_attrs)?;

    let column_names: Vec<String> =
        parsed_attrs.iter().map(|(ident, a)| a.rename.clone().unwrap_or_else(|| ident.to_string())).collect();

    let primary_key_index = parsed_attrs.iter().position(|(_, a)| a.primary_key);
    let primary_key_index = match primary_key_index {
        Some(i) => quote! { ::std::option::Option::Some(#i) },
        None => quote! { ::std::option::Option::None },
    };
    let unique_indexes: Vec<(String, usize)> = parsed_attrs
        .iter()
        .enumerate()
        .filter(|(_, (_, a))| a.unique)
        .map(|(i, (ident, a))| (a.rename.clone().unwrap_or_else(|| ident.to_string()), i))
        .collect();
    let unique_names = unique_indexes.iter().map(|(name, _)| name);
    let unique_idx = unique_indexes.iter().map(|(_, idx)| idx);

    let field_count = names.len();

    Ok(quote! {
        #[automatically_derived]
        impl ::rtdb_client::Row for #ident {
            fn row_type() -> ::rtdb_client::AlgebraicType {
                ::rtdb_client::AlgebraicType::Product(vec![
                    #(
                        ::rtdb_client::ProductField {
                            name: #column_names.to_string(),
                            ty: <#tys as ::rtdb_client::AlgebraicTyped>::algebraic_type(),
                        },
                    )*
                ])
            }

            fn table_schema() -> ::rtdb_client::TableSchema {
                ::rtdb_client::TableSchema {
                    primary_key_index: #primary_key_index,
                    unique_indexes: vec![#((#unique_names.to_string(), #unique_idx)),*],
                    row_type: ::std::option::Option::Some(<Self as ::rtdb_client::Row>::row_type()),
                }
            }

            fn into_algebraic_value(self) -> ::rtdb_client::AlgebraicValue {
                ::rtdb_client::AlgebraicValue::Product(vec![
                    #(::rtdb_client::AlgebraicTyped::into_algebraic_value(self.#names)),*
                ])
            }

            fn from_algebraic_value(
                value: ::rtdb_client::AlgebraicValue,
            ) -> ::rtdb_client::Result<Self> {
                let fields = match value {
                    ::rtdb_client::AlgebraicValue::Product(fields) if fields.len() == #field_count => fields,
                    other => {
                        return ::std::result::Result::Err(::rtdb_client::error::CodecError::InvalidTag {
                            expected: ::rtdb_client::AlgebraicType::Product(vec![]).tag(),
                            found: other.guess_type().tag(),
                        }
                        .into());
                    }
                };
                let mut fields = fields.into_iter();
                #(
                    let #names = <#tys as ::rtdb_client::AlgebraicTyped>::from_algebraic_value(
                        fields.next().expect("length checked above"),
                    )?;
                )*
                Ok(Self { #(#names),* })
            }
        }
    })
}
