//! Named type registry: an arena of [`AlgebraicType`]s indexed by integer,
//! so recursive/cyclic type references can be expressed without
//! multiple-ownership (`Rc`/`Arc`) bookkeeping at every recursive site —
//! exactly the strategy spec §9 prescribes ("Cycles in type references").

use std::collections::HashMap;

use crate::codec::value::AlgebraicType;
use crate::error::{CodecError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef(pub u32);

#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: Vec<AlgebraicType>,
    names: HashMap<String, TypeRef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a slot for a type that may recursively reference itself,
    /// returning the `TypeRef` to use in the recursive position before the
    /// definition is finished.
    pub fn reserve(&mut self, name: impl Into<String>) -> TypeRef {
        let idx = self.types.len() as u32;
        self.types.push(AlgebraicType::Bool); // placeholder, replaced by `define`
        let r = TypeRef(idx);
        self.names.insert(name.into(), r);
        r
    }

    pub fn define(&mut self, r: TypeRef, ty: AlgebraicType) {
        self.types[r.0 as usize] = ty;
    }

    pub fn register(&mut self, name: impl Into<String>, ty: AlgebraicType) -> TypeRef {
        let r = self.reserve(name);
        self.define(r, ty);
        r
    }

    pub fn resolve(&self, r: TypeRef) -> Result<&AlgebraicType> {
        self.types
            .get(r.0 as usize)
            .ok_or(CodecError::UnknownTypeRef(r.0))
            .map_err(Into::into)
    }

    pub fn resolve_by_name(&self, name: &str) -> Option<TypeRef> {
        self.names.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::{AlgebraicType, ProductField};

    #[test]
    fn recursive_type_resolves_through_arena() {
        let mut reg = TypeRegistry::new();
        let node_ref = reg.reserve("Node");
        let node_ty = AlgebraicType::Product(vec![
            ProductField::new("value", AlgebraicType::I32),
            ProductField::new("next", AlgebraicType::Option(Box::new(AlgebraicType::Ref(node_ref)))),
        ]);
        reg.define(node_ref, node_ty);

        let resolved = reg.resolve(node_ref).unwrap();
        match resolved {
            AlgebraicType::Product(fields) => assert_eq!(fields.len(), 2),
            _ => panic!("expected product"),
        }
    }
}
