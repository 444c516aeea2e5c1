//! Primitive read/write extension traits over [`bytes::Buf`]/[`bytes::BufMut`].
//!
//! Mirrors the shape of the `ClickhouseRead`/`ClickhouseWrite` extension
//! traits in `examples/Protryon-klickhouse/klickhouse/src/io.rs`, adapted
//! from async varint streaming (ClickHouse's wire format) to
//! synchronous fixed-width little-endian framing, since spec §4.1 is
//! explicit that sizes here are "little-endian unsigned integers", not
//! LEB128 varints, and whole messages arrive as one already-read frame
//! (see `transport.rs`), so there is no need to read field-by-field off a
//! live socket.

use bytes::{Buf, BufMut};

use crate::error::{CodecError, Result};

pub const DEFAULT_MAX_PAYLOAD: usize = 1 << 30; // 1 GiB, spec §4.1 default.

pub trait WireRead: Buf {
    fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.get_u8())
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.get_u16_le())
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.get_u32_le())
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.get_u64_le())
    }

    fn read_i8(&mut self) -> Result<i8> {
        self.need(1)?;
        Ok(self.get_i8())
    }

    fn read_i16_le(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.get_i16_le())
    }

    fn read_i32_le(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.get_i32_le())
    }

    fn read_i64_le(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.get_i64_le())
    }

    fn read_f32_le(&mut self) -> Result<f32> {
        self.need(4)?;
        let v = self.get_f32_le();
        if v.is_nan() || v.is_infinite() {
            return Err(CodecError::InvalidFloat.into());
        }
        Ok(v)
    }

    fn read_f64_le(&mut self) -> Result<f64> {
        self.need(8)?;
        let v = self.get_f64_le();
        if v.is_nan() || v.is_infinite() {
            return Err(CodecError::InvalidFloat.into());
        }
        Ok(v)
    }

    fn read_bytes_framed(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let len = self.read_u32_le()? as usize;
        if len > max_len {
            return Err(CodecError::TooLarge { size: len, max: max_len }.into());
        }
        self.need(len)?;
        let mut buf = vec![0u8; len];
        self.copy_to_slice(&mut buf);
        Ok(buf)
    }

    fn read_string_framed(&mut self, max_len: usize) -> Result<String> {
        let bytes = self.read_bytes_framed(max_len)?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUTF8.into())
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(CodecError::BufferTooSmall {
                needed: n,
                available: self.remaining(),
            }
            .into());
        }
        Ok(())
    }
}

impl<T: Buf + ?Sized> WireRead for T {}

pub trait WireWrite: BufMut {
    fn write_u8(&mut self, v: u8) {
        self.put_u8(v);
    }

    fn write_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    fn write_u16_le(&mut self, v: u16) {
        self.put_u16_le(v);
    }

    fn write_u32_le(&mut self, v: u32) {
        self.put_u32_le(v);
    }

    fn write_u64_le(&mut self, v: u64) {
        self.put_u64_le(v);
    }

    fn write_i8(&mut self, v: i8) {
        self.put_i8(v);
    }

    fn write_i16_le(&mut self, v: i16) {
        self.put_i16_le(v);
    }

    fn write_i32_le(&mut self, v: i32) {
        self.put_i32_le(v);
    }

    fn write_i64_le(&mut self, v: i64) {
        self.put_i64_le(v);
    }

    fn write_f32_le(&mut self, v: f32) -> Result<()> {
        if v.is_nan() || v.is_infinite() {
            return Err(CodecError::InvalidFloat.into());
        }
        self.put_f32_le(v);
        Ok(())
    }

    fn write_f64_le(&mut self, v: f64) -> Result<()> {
        if v.is_nan() || v.is_infinite() {
            return Err(CodecError::InvalidFloat.into());
        }
        self.put_f64_le(v);
        Ok(())
    }

    fn write_bytes_framed(&mut self, data: &[u8]) {
        self.put_u32_le(data.len() as u32);
        self.put_slice(data);
    }

    fn write_string_framed(&mut self, s: &str) {
        self.write_bytes_framed(s.as_bytes());
    }
}

impl<T: BufMut + ?Sized> WireWrite for T {}
