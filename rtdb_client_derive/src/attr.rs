//! Per-field `#[rtdb(...)]` attribute parsing, grounded on the
//! `#[klickhouse(...)]` attribute walking in
//! `examples/Protryon-klickhouse/klickhouse_derive/src/attr.rs`, pared
//! down to the three knobs a table row actually needs: which field is the
//! primary key, which fields are secondary unique indexes (spec §4.7's
//! `find_by_<column>` lookups), and an optional wire column rename.

use crate::symbol::{PRIMARY_KEY, RENAME, RTDB, UNIQUE};

#[derive(Default)]
pub struct FieldAttrs {
    pub rename: Option<String>,
    pub primary_key: bool,
    pub unique: bool,
}

impl FieldAttrs {
    pub fn from_ast(field: &syn::Field) -> syn::Result<Self> {
        let mut attrs = FieldAttrs::default();
        for attr in &field.attrs {
            if !attr.path().is_ident(&RTDB) {
                continue;
            }
            attr.parse_nested_meta(|meta| {
                if meta.path == PRIMARY_KEY {
                    attrs.primary_key = true;
                } else if meta.path == UNIQUE {
                    attrs.unique = true;
                } else if meta.path == RENAME {
                    let value = meta.value()?;
                    let lit: syn::LitStr = value.parse()?;
                    attrs.rename = Some(lit.value());
                } else {
                    return Err(meta.error("unsupported rtdb field attribute"));
                }
                Ok(())
            })?;
        }
        Ok(attrs)
    }
}

/// Rejects attribute combinations that don't make sense up front instead of
/// producing a confusing downstream type error.
pub fn check_primary_keys(fields: &[(syn::Ident, FieldAttrs)]) -> syn::Result<()> {
    let count = fields.iter().filter(|(_, a)| a.primary_key).count();
    if count > 1 {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "at most one field may be marked #[rtdb(primary_key)]",
        ));
    }
    Ok(())
}
