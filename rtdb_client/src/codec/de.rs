//! Decodes an [`AlgebraicValue`] from the wire's tagged byte tree against an
//! expected [`AlgebraicType`] shape (spec §3/§4.1).

use bytes::Buf;
use indexmap::IndexMap;

use crate::codec::io::{WireRead, DEFAULT_MAX_PAYLOAD};
use crate::codec::registry::TypeRegistry;
use crate::codec::value::{AlgebraicType, AlgebraicValue};
use crate::error::{CodecError, Result};

pub fn decode<B: Buf>(buf: &mut B, ty: &AlgebraicType, registry: &TypeRegistry) -> Result<AlgebraicValue> {
    decode_with_limit(buf, ty, registry, DEFAULT_MAX_PAYLOAD)
}

/// Reads the one-byte type tag that precedes every scalar value on the wire
/// (spec §4.1: "Each value is preceded by a one-byte type tag; the
/// descriptor fixes the expected tag so mismatches fail with
/// InvalidTagError") and checks it against `ty`'s expected tag.
fn expect_tag<B: Buf>(buf: &mut B, ty: &AlgebraicType) -> Result<()> {
    let found = buf.read_u8()?;
    let expected = ty.tag();
    if found != expected {
        return Err(CodecError::InvalidTag { expected, found }.into());
    }
    Ok(())
}

pub fn decode_with_limit<B: Buf>(
    buf: &mut B,
    ty: &AlgebraicType,
    registry: &TypeRegistry,
    max_len: usize,
) -> Result<AlgebraicValue> {
    Ok(match ty {
        AlgebraicType::Bool => {
            expect_tag(buf, ty)?;
            AlgebraicValue::Bool(buf.read_bool()?)
        }
        AlgebraicType::I8 => {
            expect_tag(buf, ty)?;
            AlgebraicValue::I8(buf.read_i8()?)
        }
        AlgebraicType::I16 => {
            expect_tag(buf, ty)?;
            AlgebraicValue::I16(buf.read_i16_le()?)
        }
        AlgebraicType::I32 => {
            expect_tag(buf, ty)?;
            AlgebraicValue::I32(buf.read_i32_le()?)
        }
        AlgebraicType::I64 => {
            expect_tag(buf, ty)?;
            AlgebraicValue::I64(buf.read_i64_le()?)
        }
        AlgebraicType::U8 => {
            expect_tag(buf, ty)?;
            AlgebraicValue::U8(buf.read_u8()?)
        }
        AlgebraicType::U16 => {
            expect_tag(buf, ty)?;
            AlgebraicValue::U16(buf.read_u16_le()?)
        }
        AlgebraicType::U32 => {
            expect_tag(buf, ty)?;
            AlgebraicValue::U32(buf.read_u32_le()?)
        }
        AlgebraicType::U64 => {
            expect_tag(buf, ty)?;
            AlgebraicValue::U64(buf.read_u64_le()?)
        }
        AlgebraicType::F32 => {
            expect_tag(buf, ty)?;
            AlgebraicValue::F32(buf.read_f32_le()?)
        }
        AlgebraicType::F64 => {
            expect_tag(buf, ty)?;
            AlgebraicValue::F64(buf.read_f64_le()?)
        }
        AlgebraicType::String => {
            expect_tag(buf, ty)?;
            AlgebraicValue::String(buf.read_string_framed(max_len)?)
        }
        AlgebraicType::Bytes => {
            expect_tag(buf, ty)?;
            AlgebraicValue::Bytes(buf.read_bytes_framed(max_len)?)
        }
        AlgebraicType::Identity => {
            expect_tag(buf, ty)?;
            buf.need(32)?;
            let mut bytes = [0u8; 32];
            buf.copy_to_slice(&mut bytes);
            AlgebraicValue::Identity(crate::identity::Identity::from_bytes(bytes))
        }
        AlgebraicType::Address => {
            expect_tag(buf, ty)?;
            buf.need(16)?;
            let mut bytes = [0u8; 16];
            buf.copy_to_slice(&mut bytes);
            AlgebraicValue::Address(crate::identity::ConnectionId::from_bytes(bytes))
        }
        AlgebraicType::Timestamp => {
            expect_tag(buf, ty)?;
            AlgebraicValue::Timestamp(crate::time::Timestamp::from_micros(buf.read_i64_le()?))
        }
        AlgebraicType::Duration => {
            expect_tag(buf, ty)?;
            AlgebraicValue::Duration(crate::time::Duration::from_micros(buf.read_i64_le()?))
        }
        AlgebraicType::Product(fields) => {
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                values.push(decode_with_limit(buf, &field.ty, registry, max_len)?);
            }
            AlgebraicValue::Product(values)
        }
        AlgebraicType::Sum(variants) => {
            let tag = buf.read_u8()?;
            let variant = variants
                .get(tag as usize)
                .ok_or(CodecError::InvalidTag { expected: variants.len() as u8, found: tag })?;
            let value = decode_with_limit(buf, &variant.ty, registry, max_len)?;
            AlgebraicValue::Sum { tag, value: Box::new(value) }
        }
        AlgebraicType::Array(elem_ty) => {
            let len = buf.read_u32_le()? as usize;
            if len > max_len {
                return Err(CodecError::TooLarge { size: len, max: max_len }.into());
            }
            let mut items = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                items.push(decode_with_limit(buf, elem_ty, registry, max_len)?);
            }
            AlgebraicValue::Array(items)
        }
        AlgebraicType::Map(key_ty, val_ty) => {
            let len = buf.read_u32_le()? as usize;
            if len > max_len {
                return Err(CodecError::TooLarge { size: len, max: max_len }.into());
            }
            let mut entries = IndexMap::with_capacity(len.min(4096));
            for _ in 0..len {
                let k = decode_with_limit(buf, key_ty, registry, max_len)?;
                let v = decode_with_limit(buf, val_ty, registry, max_len)?;
                entries.insert(k, v);
            }
            AlgebraicValue::Map(entries)
        }
        AlgebraicType::Option(inner_ty) => {
            let tag = buf.read_u8()?;
            match tag {
                0 => AlgebraicValue::Option(None),
                1 => AlgebraicValue::Option(Some(Box::new(decode_with_limit(buf, inner_ty, registry, max_len)?))),
                found => return Err(CodecError::InvalidTag { expected: 1, found }.into()),
            }
        }
        AlgebraicType::Ref(type_ref) => {
            let resolved = registry.resolve(*type_ref)?.clone();
            decode_with_limit(buf, &resolved, registry, max_len)?
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn rejects_oversized_framed_string() {
        let registry = TypeRegistry::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[AlgebraicType::String.tag()]);
        buf.extend_from_slice(&(100u32).to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]); // short, but declared length is 100
        let mut bytes = buf.freeze();
        let err = decode_with_limit(&mut bytes, &AlgebraicType::String, &registry, 10);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_mismatched_scalar_tag() {
        let registry = TypeRegistry::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[AlgebraicType::I32.tag()]);
        buf.extend_from_slice(&42i32.to_le_bytes());
        let mut bytes = buf.freeze();
        let err = decode_with_limit(&mut bytes, &AlgebraicType::U32, &registry, DEFAULT_MAX_PAYLOAD);
        match err {
            Err(crate::error::RtdbError::Codec(CodecError::InvalidTag { .. })) => {}
            other => panic!("expected InvalidTag, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_sum_tag() {
        let registry = TypeRegistry::new();
        let ty = AlgebraicType::Sum(vec![crate::codec::value::SumVariant::new("A", AlgebraicType::Bool)]);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[5u8]);
        let mut bytes = buf.freeze();
        assert!(decode(&mut bytes, &ty, &registry).is_err());
    }

    #[test]
    fn decodes_empty_product() {
        let registry = TypeRegistry::new();
        let ty = AlgebraicType::Product(vec![]);
        let mut bytes = bytes::Bytes::new();
        let value = decode(&mut bytes, &ty, &registry).unwrap();
        match value {
            AlgebraicValue::Product(fields) => assert!(fields.is_empty()),
            _ => panic!("expected product"),
        }
    }
}
