//! Wire encoding primitives.
//!
//! All protocol messages share one deterministic byte format:
//!
//! - **Integers**: little-endian
//! - **Fixed arrays**: elements consecutively, no length prefix
//! - **Variable sequences / byte strings**: u32 length prefix, then elements
//! - **Strings**: u32 byte length, then UTF-8 bytes
//! - **Options**: 0x00 for None, 0x01 + value for Some
//! - **Structs**: fields in declaration order, no padding
//!
//! Message codes on the frame header use unsigned LEB128 varints, see
//! [`put_uvarint`] / [`get_uvarint`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors during wire decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Not enough bytes to decode
    #[error("insufficient bytes: expected {expected}, got {available}")]
    InsufficientBytes {
        /// Expected number of bytes
        expected: usize,
        /// Actually available bytes
        available: usize,
    },

    /// Invalid UTF-8 string
    #[error("invalid UTF-8 string: {0}")]
    InvalidUtf8(String),

    /// Invalid enum tag
    #[error("invalid enum tag: {0}")]
    InvalidTag(u64),

    /// Varint longer than 10 bytes or overflowing u64
    #[error("varint overflow")]
    VarintOverflow,

    /// Value outside its permitted range
    #[error("value out of range: {0}")]
    OutOfRange(String),
}

/// Trait for types with a deterministic wire representation.
pub trait WireEncode {
    /// Appends the encoded value to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Returns the encoded byte representation.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Trait for types decodable from the wire representation.
pub trait WireDecode: Sized {
    /// Decodes a value from the front of `buf`.
    fn decode(buf: &mut Bytes) -> Result<Self, WireError>;

    /// Decodes from a byte slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        Self::decode(&mut buf)
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        return Err(WireError::InsufficientBytes {
            expected: n,
            available: buf.remaining(),
        });
    }
    Ok(())
}

impl WireEncode for u8 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self);
    }
}

impl WireDecode for u8 {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, 1)?;
        Ok(buf.get_u8())
    }
}

impl WireEncode for u16 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(*self);
    }
}

impl WireDecode for u16 {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, 2)?;
        Ok(buf.get_u16_le())
    }
}

impl WireEncode for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(*self);
    }
}

impl WireDecode for u32 {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, 4)?;
        Ok(buf.get_u32_le())
    }
}

impl WireEncode for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(*self);
    }
}

impl WireDecode for u64 {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, 8)?;
        Ok(buf.get_u64_le())
    }
}

impl<const N: usize> WireEncode for [u8; N] {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
}

impl<const N: usize> WireDecode for [u8; N] {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, N)?;
        let mut arr = [0u8; N];
        buf.copy_to_slice(&mut arr);
        Ok(arr)
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(self.len() <= u32::MAX as usize);
        (self.len() as u32).encode(buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let len = u32::decode(buf)? as usize;
        let mut vec = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            vec.push(T::decode(buf)?);
        }
        Ok(vec)
    }
}

impl WireEncode for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(self.len() <= u32::MAX as usize);
        (self.len() as u32).encode(buf);
        buf.put_slice(self);
    }
}

impl WireDecode for Bytes {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let len = u32::decode(buf)? as usize;
        need(buf, len)?;
        Ok(buf.copy_to_bytes(len))
    }
}

impl WireEncode for String {
    fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(self.len() <= u32::MAX as usize);
        (self.len() as u32).encode(buf);
        buf.put_slice(self.as_bytes());
    }
}

impl WireDecode for String {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let len = u32::decode(buf)? as usize;
        need(buf, len)?;
        let bytes = buf.copy_to_bytes(len);
        String::from_utf8(bytes.to_vec()).map_err(|e| WireError::InvalidUtf8(e.to_string()))
    }
}

impl<T: WireEncode> WireEncode for Option<T> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            None => buf.put_u8(0x00),
            Some(value) => {
                buf.put_u8(0x01);
                value.encode(buf);
            }
        }
    }
}

impl<T: WireDecode> WireDecode for Option<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        match u8::decode(buf)? {
            0x00 => Ok(None),
            0x01 => Ok(Some(T::decode(buf)?)),
            tag => Err(WireError::InvalidTag(tag as u64)),
        }
    }
}

/// Appends `value` as an unsigned LEB128 varint.
pub fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Reads an unsigned LEB128 varint from the front of `buf`.
pub fn get_uvarint(buf: &mut Bytes) -> Result<u64, WireError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = u8::decode(buf)?;
        if shift == 63 && byte > 1 {
            return Err(WireError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(WireError::VarintOverflow);
        }
    }
}
