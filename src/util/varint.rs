//! Variable-length integer encoding utilities.
//!
//! 7 bits per byte with a continuation bit, as used by protocol buffers and
//! most binary index formats. Small values (the common case for value lengths
//! and doc-id deltas) encode to a single byte.

use std::io::Read;

use byteorder::ReadBytesExt;

use crate::error::{FalcataError, Result};

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Decode a u64 value from a byte slice.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;
    let mut bytes_read = 0;

    for &byte in bytes {
        bytes_read += 1;

        if shift >= 64 {
            return Err(FalcataError::serialization("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, bytes_read));
        }

        shift += 7;
    }

    Err(FalcataError::serialization("Incomplete VarInt"))
}

/// Read a varint-encoded u64 from a stream.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        if shift >= 64 {
            return Err(FalcataError::serialization("VarInt overflow"));
        }

        let byte = reader.read_u8()?;
        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

/// Number of bytes `value` occupies when varint-encoded.
pub fn encoded_len(value: u64) -> usize {
    let mut len = 1;
    let mut val = value >> 7;
    while val != 0 {
        len += 1;
        val >>= 7;
    }
    len
}
