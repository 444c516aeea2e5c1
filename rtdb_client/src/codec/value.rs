//! [`AlgebraicType`] / [`AlgebraicValue`]: the self-describing tagged value
//! tree of spec §3/§4.1/§9 ("Polymorphism over shape, not inheritance" —
//! implemented as a closed tagged variant dispatched by the type byte, not
//! virtual dispatch).

use indexmap::IndexMap;

use crate::codec::registry::TypeRef;
use crate::identity::{ConnectionId, Identity};
use crate::time::{Duration, Timestamp};

/// One-byte wire tags, spec §6: "Tag constants include boolean false/true,
/// signed and unsigned integer widths, f32/f64, string, bytes, list, option
/// none/some, struct, enum, array, and 128/256-bit integer extensions
/// reserved but not required in v1."
pub mod tags {
    pub const BOOL_FALSE: u8 = 0x00;
    pub const BOOL_TRUE: u8 = 0x01;
    pub const I8: u8 = 0x02;
    pub const I16: u8 = 0x03;
    pub const I32: u8 = 0x04;
    pub const I64: u8 = 0x05;
    pub const U8: u8 = 0x06;
    pub const U16: u8 = 0x07;
    pub const U32: u8 = 0x08;
    pub const U64: u8 = 0x09;
    pub const F32: u8 = 0x0A;
    pub const F64: u8 = 0x0B;
    pub const STRING: u8 = 0x0C;
    pub const BYTES: u8 = 0x0D;
    pub const LIST: u8 = 0x0E;
    pub const OPTION_NONE: u8 = 0x0F;
    pub const OPTION_SOME: u8 = 0x10;
    pub const STRUCT: u8 = 0x11;
    pub const ENUM: u8 = 0x12;
    pub const ARRAY: u8 = 0x13;
    pub const MAP: u8 = 0x14;
    pub const IDENTITY: u8 = 0x15;
    pub const ADDRESS: u8 = 0x16;
    pub const TIMESTAMP: u8 = 0x17;
    pub const DURATION: u8 = 0x18;
    // Reserved, not required in v1 (spec §6).
    pub const I128: u8 = 0x19;
    pub const U128: u8 = 0x1A;
    pub const I256: u8 = 0x1B;
    pub const U256: u8 = 0x1C;
}

/// Named field of a [`AlgebraicType::Product`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProductField {
    pub name: String,
    pub ty: AlgebraicType,
}

impl ProductField {
    pub fn new(name: impl Into<String>, ty: AlgebraicType) -> Self {
        Self { name: name.into(), ty }
    }
}

/// Named variant of a [`AlgebraicType::Sum`].
#[derive(Debug, Clone, PartialEq)]
pub struct SumVariant {
    pub name: String,
    pub ty: AlgebraicType,
}

impl SumVariant {
    pub fn new(name: impl Into<String>, ty: AlgebraicType) -> Self {
        Self { name: name.into(), ty }
    }
}

/// The type descriptor accompanying every [`AlgebraicValue`] on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum AlgebraicType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    String,
    Bytes,
    /// Ordered named fields (a "struct").
    Product(Vec<ProductField>),
    /// Tagged variants, one-byte discriminant (an "enum").
    Sum(Vec<SumVariant>),
    /// Homogeneous sequence of a single element type.
    Array(Box<AlgebraicType>),
    /// Length-prefixed key/value pairs.
    Map(Box<AlgebraicType>, Box<AlgebraicType>),
    /// 0 = none, 1 = some + payload.
    Option(Box<AlgebraicType>),
    /// Resolved via the [`crate::codec::registry::TypeRegistry`].
    Ref(TypeRef),
    Identity,
    Address,
    Timestamp,
    Duration,
}

impl AlgebraicType {
    pub fn tag(&self) -> u8 {
        match self {
            AlgebraicType::Bool => tags::BOOL_FALSE,
            AlgebraicType::I8 => tags::I8,
            AlgebraicType::I16 => tags::I16,
            AlgebraicType::I32 => tags::I32,
            AlgebraicType::I64 => tags::I64,
            AlgebraicType::U8 => tags::U8,
            AlgebraicType::U16 => tags::U16,
            AlgebraicType::U32 => tags::U32,
            AlgebraicType::U64 => tags::U64,
            AlgebraicType::F32 => tags::F32,
            AlgebraicType::F64 => tags::F64,
            AlgebraicType::String => tags::STRING,
            AlgebraicType::Bytes => tags::BYTES,
            AlgebraicType::Product(_) => tags::STRUCT,
            AlgebraicType::Sum(_) => tags::ENUM,
            AlgebraicType::Array(_) => tags::ARRAY,
            AlgebraicType::Map(_, _) => tags::MAP,
            AlgebraicType::Option(_) => tags::OPTION_SOME,
            AlgebraicType::Ref(_) => tags::STRUCT,
            AlgebraicType::Identity => tags::IDENTITY,
            AlgebraicType::Address => tags::ADDRESS,
            AlgebraicType::Timestamp => tags::TIMESTAMP,
            AlgebraicType::Duration => tags::DURATION,
        }
    }

    /// A zero/empty value for this type, used to justify `None` rows.
    pub fn default_value(&self) -> AlgebraicValue {
        match self {
            AlgebraicType::Bool => AlgebraicValue::Bool(false),
            AlgebraicType::I8 => AlgebraicValue::I8(0),
            AlgebraicType::I16 => AlgebraicValue::I16(0),
            AlgebraicType::I32 => AlgebraicValue::I32(0),
            AlgebraicType::I64 => AlgebraicValue::I64(0),
            AlgebraicType::U8 => AlgebraicValue::U8(0),
            AlgebraicType::U16 => AlgebraicValue::U16(0),
            AlgebraicType::U32 => AlgebraicValue::U32(0),
            AlgebraicType::U64 => AlgebraicValue::U64(0),
            AlgebraicType::F32 => AlgebraicValue::F32(0.0),
            AlgebraicType::F64 => AlgebraicValue::F64(0.0),
            AlgebraicType::String => AlgebraicValue::String(String::new()),
            AlgebraicType::Bytes => AlgebraicValue::Bytes(Vec::new()),
            AlgebraicType::Product(fields) => {
                AlgebraicValue::Product(fields.iter().map(|f| f.ty.default_value()).collect())
            }
            AlgebraicType::Sum(variants) => AlgebraicValue::Sum {
                tag: 0,
                value: Box::new(
                    variants
                        .first()
                        .map(|v| v.ty.default_value())
                        .unwrap_or(AlgebraicValue::Product(vec![])),
                ),
            },
            AlgebraicType::Array(_) => AlgebraicValue::Array(Vec::new()),
            AlgebraicType::Map(_, _) => AlgebraicValue::Map(IndexMap::new()),
            AlgebraicType::Option(_) => AlgebraicValue::Option(None),
            AlgebraicType::Ref(_) => AlgebraicValue::Product(vec![]),
            AlgebraicType::Identity => AlgebraicValue::Identity(Identity::ANONYMOUS),
            AlgebraicType::Address => AlgebraicValue::Address(ConnectionId::ZERO),
            AlgebraicType::Timestamp => AlgebraicValue::Timestamp(Timestamp::from_micros(0)),
            AlgebraicType::Duration => AlgebraicValue::Duration(Duration::zero()),
        }
    }
}

/// A concrete value conforming to some [`AlgebraicType`].
#[derive(Debug, Clone, PartialEq)]
pub enum AlgebraicValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Product(Vec<AlgebraicValue>),
    Sum { tag: u8, value: Box<AlgebraicValue> },
    Array(Vec<AlgebraicValue>),
    Map(IndexMap<AlgebraicValue, AlgebraicValue>),
    Option(Option<Box<AlgebraicValue>>),
    Identity(Identity),
    Address(ConnectionId),
    Timestamp(Timestamp),
    Duration(Duration),
}

// `AlgebraicValue` is used as a map key (spec's Map type), so it needs
// `Eq`/`Hash`. Floats are compared/hashed bitwise, matching the codec's
// rejection of NaN/Inf on write (spec §3) -- every float that ever reaches
// here is finite, so bitwise equality coincides with value equality.
impl Eq for AlgebraicValue {}

impl std::hash::Hash for AlgebraicValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            AlgebraicValue::Bool(v) => v.hash(state),
            AlgebraicValue::I8(v) => v.hash(state),
            AlgebraicValue::I16(v) => v.hash(state),
            AlgebraicValue::I32(v) => v.hash(state),
            AlgebraicValue::I64(v) => v.hash(state),
            AlgebraicValue::U8(v) => v.hash(state),
            AlgebraicValue::U16(v) => v.hash(state),
            AlgebraicValue::U32(v) => v.hash(state),
            AlgebraicValue::U64(v) => v.hash(state),
            AlgebraicValue::F32(v) => v.to_bits().hash(state),
            AlgebraicValue::F64(v) => v.to_bits().hash(state),
            AlgebraicValue::String(v) => v.hash(state),
            AlgebraicValue::Bytes(v) => v.hash(state),
            AlgebraicValue::Product(v) => v.hash(state),
            AlgebraicValue::Sum { tag, value } => {
                tag.hash(state);
                value.hash(state);
            }
            AlgebraicValue::Array(v) => v.hash(state),
            AlgebraicValue::Map(_) => {
                // Maps as keys are not a supported use case; hash by length only.
                0u8.hash(state);
            }
            AlgebraicValue::Option(v) => v.hash(state),
            AlgebraicValue::Identity(v) => v.0.hash(state),
            AlgebraicValue::Address(v) => v.0.hash(state),
            AlgebraicValue::Timestamp(v) => v.as_micros().hash(state),
            AlgebraicValue::Duration(v) => v.as_micros().hash(state),
        }
    }
}

impl AlgebraicValue {
    /// Guesses the [`AlgebraicType`] of this value (may not match an
    /// authoritative table schema; used for ad-hoc one-off query results).
    pub fn guess_type(&self) -> AlgebraicType {
        match self {
            AlgebraicValue::Bool(_) => AlgebraicType::Bool,
            AlgebraicValue::I8(_) => AlgebraicType::I8,
            AlgebraicValue::I16(_) => AlgebraicType::I16,
            AlgebraicValue::I32(_) => AlgebraicType::I32,
            AlgebraicValue::I64(_) => AlgebraicType::I64,
            AlgebraicValue::U8(_) => AlgebraicType::U8,
            AlgebraicValue::U16(_) => AlgebraicType::U16,
            AlgebraicValue::U32(_) => AlgebraicType::U32,
            AlgebraicValue::U64(_) => AlgebraicType::U64,
            AlgebraicValue::F32(_) => AlgebraicType::F32,
            AlgebraicValue::F64(_) => AlgebraicType::F64,
            AlgebraicValue::String(_) => AlgebraicType::String,
            AlgebraicValue::Bytes(_) => AlgebraicType::Bytes,
            AlgebraicValue::Product(fields) => AlgebraicType::Product(
                fields
                    .iter()
                    .enumerate()
                    .map(|(i, v)| ProductField::new(format!("_{i}"), v.guess_type()))
                    .collect(),
            ),
            AlgebraicValue::Sum { value, .. } => {
                AlgebraicType::Sum(vec![SumVariant::new("_0", value.guess_type())])
            }
            AlgebraicValue::Array(items) => AlgebraicType::Array(Box::new(
                items.first().map(|v| v.guess_type()).unwrap_or(AlgebraicType::Bool),
            )),
            AlgebraicValue::Map(m) => {
                let (k, v) = m
                    .iter()
                    .next()
                    .map(|(k, v)| (k.guess_type(), v.guess_type()))
                    .unwrap_or((AlgebraicType::String, AlgebraicType::Bool));
                AlgebraicType::Map(Box::new(k), Box::new(v))
            }
            AlgebraicValue::Option(inner) => AlgebraicType::Option(Box::new(
                inner.as_ref().map(|v| v.guess_type()).unwrap_or(AlgebraicType::Bool),
            )),
            AlgebraicValue::Identity(_) => AlgebraicType::Identity,
            AlgebraicValue::Address(_) => AlgebraicType::Address,
            AlgebraicValue::Timestamp(_) => AlgebraicType::Timestamp,
            AlgebraicValue::Duration(_) => AlgebraicType::Duration,
        }
    }

    pub fn as_product(&self) -> Option<&[AlgebraicValue]> {
        match self {
            AlgebraicValue::Product(fields) => Some(fields),
            _ => None,
        }
    }
}
