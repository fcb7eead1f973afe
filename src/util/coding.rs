//! Encoding utilities for variable-length integers and fixed-width values.

use bytes::{Buf, BufMut, BytesMut};

/// Maximum bytes needed to encode a varint64.
pub const MAX_VARINT64_LEN: usize = 10;

/// Maximum bytes needed to encode a varint32.
pub const MAX_VARINT32_LEN: usize = 5;

/// Encode a 32-bit unsigned integer as a varint.
pub fn encode_varint32(buf: &mut BytesMut, mut value: u32) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Encode a 64-bit unsigned integer as a varint.
pub fn encode_varint64(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decode a 32-bit varint from a buffer, advancing it.
///
/// Returns None if the buffer is too short or the varint is malformed.
pub fn decode_varint32(buf: &mut &[u8]) -> Option<u32> {
    let mut result = 0u32;
    let mut shift = 0;

    for _ in 0..MAX_VARINT32_LEN {
        if buf.is_empty() {
            return None;
        }

        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as u32) << shift;

        if byte & 0x80 == 0 {
            return Some(result);
        }

        shift += 7;
    }

    None // Varint too long
}

/// Decode a 64-bit varint from a buffer, advancing it.
pub fn decode_varint64(buf: &mut &[u8]) -> Option<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    for _ in 0..MAX_VARINT64_LEN {
        if buf.is_empty() {
            return None;
        }

        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            return Some(result);
        }

        shift += 7;
    }

    None
}

/// Read a fixed 32-bit little-endian value from a slice without consuming.
pub fn read_fixed32(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}
