//! [`AlgebraicTyped`]: the conversion bridge between native Rust types and
//! [`AlgebraicValue`]/[`AlgebraicType`], used by `#[derive(Row)]`
//! (`rtdb_client_derive`) to generate [`Row`] impls without hand-written
//! per-field boilerplate, spec §9's "Dynamic attribute lookup for tables"
//! redesign note: typed helpers are codegen'd from the module schema
//! instead of intercepted at runtime.

use crate::codec::value::{AlgebraicType, AlgebraicValue};
use crate::error::{CodecError, Result};
use crate::identity::{ConnectionId, Identity};
use crate::table::TableSchema;
use crate::time::{Duration, Timestamp};

/// A Rust type that knows its own wire shape. Implemented for every
/// primitive and domain type spec §3/§4.1 lists, plus `Option<T>` and
/// `Vec<T>` for any `T: AlgebraicTyped`.
pub trait AlgebraicTyped: Sized {
    fn algebraic_type() -> AlgebraicType;
    fn into_algebraic_value(self) -> AlgebraicValue;
    fn from_algebraic_value(value: AlgebraicValue) -> Result<Self>;
}

macro_rules! impl_algebraic_typed_int {
    ($rust:ty, $variant:ident, $ty:ident) => {
        impl AlgebraicTyped for $rust {
            fn algebraic_type() -> AlgebraicType {
                AlgebraicType::$ty
            }

            fn into_algebraic_value(self) -> AlgebraicValue {
                AlgebraicValue::$variant(self)
            }

            fn from_algebraic_value(value: AlgebraicValue) -> Result<Self> {
                match value {
                    AlgebraicValue::$variant(v) => Ok(v),
                    other => Err(CodecError::InvalidTag {
                        expected: AlgebraicType::$ty.tag(),
                        found: other.guess_type().tag(),
                    }
                    .into()),
                }
            }
        }
    };
}

impl_algebraic_typed_int!(bool, Bool, Bool);
impl_algebraic_typed_int!(i8, I8, I8);
impl_algebraic_typed_int!(i16, I16, I16);
impl_algebraic_typed_int!(i32, I32, I32);
impl_algebraic_typed_int!(i64, I64, I64);
impl_algebraic_typed_int!(u8, U8, U8);
impl_algebraic_typed_int!(u16, U16, U16);
impl_algebraic_typed_int!(u32, U32, U32);
impl_algebraic_typed_int!(u64, U64, U64);
impl_algebraic_typed_int!(f32, F32, F32);
impl_algebraic_typed_int!(f64, F64, F64);
impl_algebraic_typed_int!(String, String, String);

impl AlgebraicTyped for Vec<u8> {
    fn algebraic_type() -> AlgebraicType {
        AlgebraicType::Bytes
    }

    fn into_algebraic_value(self) -> AlgebraicValue {
        AlgebraicValue::Bytes(self)
    }

    fn from_algebraic_value(value: AlgebraicValue) -> Result<Self> {
        match value {
            AlgebraicValue::Bytes(v) => Ok(v),
            other => {
                Err(CodecError::InvalidTag { expected: AlgebraicType::Bytes.tag(), found: other.guess_type().tag() }
                    .into())
            }
        }
    }
}

impl AlgebraicTyped for Identity {
    fn algebraic_type() -> AlgebraicType {
        AlgebraicType::Identity
    }

    fn into_algebraic_value(self) -> AlgebraicValue {
        AlgebraicValue::Identity(self)
    }

    fn from_algebraic_value(value: AlgebraicValue) -> Result<Self> {
        match value {
            AlgebraicValue::Identity(v) => Ok(v),
            other => Err(CodecError::InvalidTag {
                expected: AlgebraicType::Identity.tag(),
                found: other.guess_type().tag(),
            }
            .into()),
        }
    }
}

impl AlgebraicTyped for ConnectionId {
    fn algebraic_type() -> AlgebraicType {
        AlgebraicType::Address
    }

    fn into_algebraic_value(self) -> AlgebraicValue {
        AlgebraicValue::Address(self)
    }

    fn from_algebraic_value(value: AlgebraicValue) -> Result<Self> {
        match value {
            AlgebraicValue::Address(v) => Ok(v),
            other => Err(CodecError::InvalidTag {
                expected: AlgebraicType::Address.tag(),
                found: other.guess_type().tag(),
            }
            .into()),
        }
    }
}

impl AlgebraicTyped for Timestamp {
    fn algebraic_type() -> AlgebraicType {
        AlgebraicType::Timestamp
    }

    fn into_algebraic_value(self) -> AlgebraicValue {
        AlgebraicValue::Timestamp(self)
    }

    fn from_algebraic_value(value: AlgebraicValue) -> Result<Self> {
        match value {
            AlgebraicValue::Timestamp(v) => Ok(v),
            other => Err(CodecError::InvalidTag {
                expected: AlgebraicType::Timestamp.tag(),
                found: other.guess_type().tag(),
            }
            .into()),
        }
    }
}

impl AlgebraicTyped for Duration {
    fn algebraic_type() -> AlgebraicType {
        AlgebraicType::Duration
    }

    fn into_algebraic_value(self) -> AlgebraicValue {
        AlgebraicValue::Duration(self)
    }

    fn from_algebraic_value(value: AlgebraicValue) -> Result<Self> {
        match value {
            AlgebraicValue::Duration(v) => Ok(v),
            other => Err(CodecError::InvalidTag {
                expected: AlgebraicType::Duration.tag(),
                found: other.guess_type().tag(),
            }
            .into()),
        }
    }
}

impl<T: AlgebraicTyped> AlgebraicTyped for Option<T> {
    fn algebraic_type() -> AlgebraicType {
        AlgebraicType::Option(Box::new(T::algebraic_type()))
    }

    fn into_algebraic_value(self) -> AlgebraicValue {
        AlgebraicValue::Option(self.map(|v| Box::new(v.into_algebraic_value())))
    }

    fn from_algebraic_value(value: AlgebraicValue) -> Result<Self> {
        match value {
            AlgebraicValue::Option(Some(v)) => Ok(Some(T::from_algebraic_value(*v)?)),
            AlgebraicValue::Option(None) => Ok(None),
            other => Err(CodecError::InvalidTag {
                expected: Self::algebraic_type().tag(),
                found: other.guess_type().tag(),
            }
            .into()),
        }
    }
}

impl<T: AlgebraicTyped> AlgebraicTyped for Vec<T> {
    fn algebraic_type() -> AlgebraicType {
        AlgebraicType::Array(Box::new(T::algebraic_type()))
    }

    fn into_algebraic_value(self) -> AlgebraicValue {
        AlgebraicValue::Array(self.into_iter().map(AlgebraicTyped::into_algebraic_value).collect())
    }

    fn from_algebraic_value(value: AlgebraicValue) -> Result<Self> {
        match value {
            AlgebraicValue::Array(items) => items.into_iter().map(T::from_algebraic_value).collect(),
            other => Err(CodecError::InvalidTag {
                expected: Self::algebraic_type().tag(),
                found: other.guess_type().tag(),
            }
            .into()),
        }
    }
}

/// A table row with a statically known shape, generated by
/// `#[derive(Row)]`. Bridges a plain Rust struct to the codec's
/// [`AlgebraicValue`]/[`AlgebraicType`] tree and to [`TableSchema`]
/// registration, spec §3 ("TableRow ... shape is declared at table
/// registration").
pub trait Row: Sized {
    fn row_type() -> AlgebraicType;

    /// Declares which field (if any) is the primary key and which are
    /// unique secondary indexes, spec §3's per-table schema.
    fn table_schema() -> TableSchema;

    fn into_algebraic_value(self) -> AlgebraicValue;

    fn from_algebraic_value(value: AlgebraicValue) -> Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitive() {
        let v = 42i32.into_algebraic_value();
        assert_eq!(i32::from_algebraic_value(v).unwrap(), 42);
    }

    #[test]
    fn round_trips_option_some_and_none() {
        let some = Some(7u32).into_algebraic_value();
        assert_eq!(Option::<u32>::from_algebraic_value(some).unwrap(), Some(7));
        let none = Option::<u32>::None.into_algebraic_value();
        assert_eq!(Option::<u32>::from_algebraic_value(none).unwrap(), None);
    }

    #[test]
    fn round_trips_vec() {
        let v = vec![1i32, 2, 3].into_algebraic_value();
        assert_eq!(Vec::<i32>::from_algebraic_value(v).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn mismatched_tag_errors() {
        let v = AlgebraicValue::String("nope".into());
        assert!(i32::from_algebraic_value(v).is_err());
    }
}
