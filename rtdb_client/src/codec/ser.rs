//! Encodes an [`AlgebraicValue`] against its [`AlgebraicType`] shape into the
//! wire's tagged byte tree (spec §3/§4.1).

use bytes::{BufMut, BytesMut};

use crate::codec::io::WireWrite;
use crate::codec::registry::TypeRegistry;
use crate::codec::value::{AlgebraicType, AlgebraicValue};
use crate::error::{CodecError, Result};

pub fn encode(buf: &mut BytesMut, ty: &AlgebraicType, value: &AlgebraicValue, registry: &TypeRegistry) -> Result<()> {
    match (ty, value) {
        (AlgebraicType::Bool, AlgebraicValue::Bool(v)) => {
            buf.write_u8(ty.tag());
            buf.write_bool(*v);
        }
        (AlgebraicType::I8, AlgebraicValue::I8(v)) => {
            buf.write_u8(ty.tag());
            buf.write_i8(*v);
        }
        (AlgebraicType::I16, AlgebraicValue::I16(v)) => {
            buf.write_u8(ty.tag());
            buf.write_i16_le(*v);
        }
        (AlgebraicType::I32, AlgebraicValue::I32(v)) => {
            buf.write_u8(ty.tag());
            buf.write_i32_le(*v);
        }
        (AlgebraicType::I64, AlgebraicValue::I64(v)) => {
            buf.write_u8(ty.tag());
            buf.write_i64_le(*v);
        }
        (AlgebraicType::U8, AlgebraicValue::U8(v)) => {
            buf.write_u8(ty.tag());
            buf.write_u8(*v);
        }
        (AlgebraicType::U16, AlgebraicValue::U16(v)) => {
            buf.write_u8(ty.tag());
            buf.write_u16_le(*v);
        }
        (AlgebraicType::U32, AlgebraicValue::U32(v)) => {
            buf.write_u8(ty.tag());
            buf.write_u32_le(*v);
        }
        (AlgebraicType::U64, AlgebraicValue::U64(v)) => {
            buf.write_u8(ty.tag());
            buf.write_u64_le(*v);
        }
        (AlgebraicType::F32, AlgebraicValue::F32(v)) => {
            buf.write_u8(ty.tag());
            buf.write_f32_le(*v)?;
        }
        (AlgebraicType::F64, AlgebraicValue::F64(v)) => {
            buf.write_u8(ty.tag());
            buf.write_f64_le(*v)?;
        }
        (AlgebraicType::String, AlgebraicValue::String(v)) => {
            buf.write_u8(ty.tag());
            buf.write_string_framed(v);
        }
        (AlgebraicType::Bytes, AlgebraicValue::Bytes(v)) => {
            buf.write_u8(ty.tag());
            buf.write_bytes_framed(v);
        }
        (AlgebraicType::Identity, AlgebraicValue::Identity(v)) => {
            buf.write_u8(ty.tag());
            buf.put_slice(v.as_bytes());
        }
        (AlgebraicType::Address, AlgebraicValue::Address(v)) => {
            buf.write_u8(ty.tag());
            buf.put_slice(v.as_bytes());
        }
        (AlgebraicType::Timestamp, AlgebraicValue::Timestamp(v)) => {
            buf.write_u8(ty.tag());
            buf.write_i64_le(v.as_micros());
        }
        (AlgebraicType::Duration, AlgebraicValue::Duration(v)) => {
            buf.write_u8(ty.tag());
            buf.write_i64_le(v.as_micros());
        }
        (AlgebraicType::Product(fields), AlgebraicValue::Product(values)) => {
            if fields.len() != values.len() {
                return Err(CodecError::Overflow.into());
            }
            for (field, value) in fields.iter().zip(values.iter()) {
                encode(buf, &field.ty, value, registry)?;
            }
        }
        (AlgebraicType::Sum(variants), AlgebraicValue::Sum { tag, value }) => {
            let variant = variants
                .get(*tag as usize)
                .ok_or(CodecError::InvalidTag { expected: variants.len() as u8, found: *tag })?;
            buf.write_u8(*tag);
            encode(buf, &variant.ty, value, registry)?;
        }
        (AlgebraicType::Array(elem_ty), AlgebraicValue::Array(items)) => {
            buf.write_u32_le(items.len() as u32);
            for item in items {
                encode(buf, elem_ty, item, registry)?;
            }
        }
        (AlgebraicType::Map(key_ty, val_ty), AlgebraicValue::Map(entries)) => {
            buf.write_u32_le(entries.len() as u32);
            for (k, v) in entries {
                encode(buf, key_ty, k, registry)?;
                encode(buf, val_ty, v, registry)?;
            }
        }
        (AlgebraicType::Option(inner_ty), AlgebraicValue::Option(inner)) => match inner {
            None => buf.write_u8(0),
            Some(inner_value) => {
                buf.write_u8(1);
                encode(buf, inner_ty, inner_value, registry)?;
            }
        },
        (AlgebraicType::Ref(type_ref), value) => {
            let resolved = registry.resolve(*type_ref)?;
            encode(buf, resolved, value, registry)?;
        }
        (expected, _) => {
            return Err(CodecError::InvalidTag { expected: expected.tag(), found: value.guess_type().tag() }.into());
        }
    }
    Ok(())
}

/// Encodes a value into a fresh buffer, self-describing its type via the
/// shape passed in (no registry indirection at the top level).
pub fn encode_to_vec(ty: &AlgebraicType, value: &AlgebraicValue, registry: &TypeRegistry) -> Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    encode(&mut buf, ty, value, registry)?;
    Ok(buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::de::decode;
    use crate::codec::value::ProductField;
    use crate::identity::{ConnectionId, Identity};
    use crate::time::{Duration, Timestamp};

    #[test]
    fn roundtrips_primitive_scalars() {
        let registry = TypeRegistry::new();
        let cases = vec![
            (AlgebraicType::Bool, AlgebraicValue::Bool(true)),
            (AlgebraicType::I32, AlgebraicValue::I32(-42)),
            (AlgebraicType::U64, AlgebraicValue::U64(u64::MAX)),
            (AlgebraicType::F64, AlgebraicValue::F64(3.5)),
            (AlgebraicType::String, AlgebraicValue::String("hello".into())),
            (AlgebraicType::Bytes, AlgebraicValue::Bytes(vec![1, 2, 3])),
            (AlgebraicType::Identity, AlgebraicValue::Identity(Identity::from_bytes([7u8; 32]))),
            (AlgebraicType::Address, AlgebraicValue::Address(ConnectionId::from_bytes([9u8; 16]))),
            (AlgebraicType::Timestamp, AlgebraicValue::Timestamp(Timestamp::from_micros(123))),
            (AlgebraicType::Duration, AlgebraicValue::Duration(Duration::from_micros(456))),
        ];
        for (ty, value) in cases {
            let mut buf = BytesMut::new();
            encode(&mut buf, &ty, &value, &registry).unwrap();
            let mut bytes = buf.freeze();
            let decoded = decode(&mut bytes, &ty, &registry).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn roundtrips_nested_product_with_option_and_array() {
        let registry = TypeRegistry::new();
        let ty = AlgebraicType::Product(vec![
            ProductField::new("name", AlgebraicType::String),
            ProductField::new("tags", AlgebraicType::Array(Box::new(AlgebraicType::String))),
            ProductField::new("parent", AlgebraicType::Option(Box::new(AlgebraicType::U32))),
        ]);
        let value = AlgebraicValue::Product(vec![
            AlgebraicValue::String("root".into()),
            AlgebraicValue::Array(vec![AlgebraicValue::String("a".into()), AlgebraicValue::String("b".into())]),
            AlgebraicValue::Option(Some(Box::new(AlgebraicValue::U32(7)))),
        ]);
        let mut buf = BytesMut::new();
        encode(&mut buf, &ty, &value, &registry).unwrap();
        let mut bytes = buf.freeze();
        let decoded = decode(&mut bytes, &ty, &registry).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn roundtrips_sum_variant() {
        let registry = TypeRegistry::new();
        let ty = AlgebraicType::Sum(vec![
            crate::codec::value::SumVariant::new("Ok", AlgebraicType::I32),
            crate::codec::value::SumVariant::new("Err", AlgebraicType::String),
        ]);
        let value = AlgebraicValue::Sum { tag: 1, value: Box::new(AlgebraicValue::String("boom".into())) };
        let mut buf = BytesMut::new();
        encode(&mut buf, &ty, &value, &registry).unwrap();
        let mut bytes = buf.freeze();
        let decoded = decode(&mut bytes, &ty, &registry).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn rejects_mismatched_field_count() {
        let registry = TypeRegistry::new();
        let ty = AlgebraicType::Product(vec![ProductField::new("a", AlgebraicType::I32)]);
        let value = AlgebraicValue::Product(vec![AlgebraicValue::I32(1), AlgebraicValue::I32(2)]);
        let mut buf = BytesMut::new();
        assert!(encode(&mut buf, &ty, &value, &registry).is_err());
    }

    #[test]
    fn resolves_ref_through_registry() {
        let mut registry = TypeRegistry::new();
        let r = registry.register("Point", AlgebraicType::Product(vec![
            ProductField::new("x", AlgebraicType::F64),
            ProductField::new("y", AlgebraicType::F64),
        ]));
        let ty = AlgebraicType::Ref(r);
        let value = AlgebraicValue::Product(vec![AlgebraicValue::F64(1.0), AlgebraicValue::F64(2.0)]);
        let mut buf = BytesMut::new();
        encode(&mut buf, &ty, &value, &registry).unwrap();
        let mut bytes = buf.freeze();
        let decoded = decode(&mut bytes, &ty, &registry).unwrap();
        assert_eq!(decoded, value);
    }
}
