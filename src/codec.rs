//! Big-endian byte conversions used by every command payload.
//!
//! The current protocol revision transmits frequencies, precision and
//! amplitude as IEEE-754 single precision floats. The double precision
//! encoder is kept for the legacy 8-byte fields of older firmware.

use crate::errors::{DriverError, Result};

/// Encode a 64-bit float as 8 big-endian bytes.
pub fn encode_double(value: f64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Encode a 32-bit float as 4 big-endian bytes.
pub fn encode_single(value: f32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Decode the first 4 bytes of `bytes` as a big-endian 32-bit float.
pub fn decode_single(bytes: &[u8]) -> Result<f32> {
    Ok(f32::from_be_bytes(take_array(bytes, 0)?))
}

/// Decode a run of consecutive big-endian 32-bit floats.
///
/// The run must be a whole number of floats; a trailing partial value is an error.
pub fn decode_single_sequence(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(DriverError::Decode(format!(
            "float run of {} bytes is not a multiple of 4",
            bytes.len()
        )));
    }
    bytes.chunks_exact(4).map(decode_single).collect()
}

/// Decode the big-endian 32-bit float at `offset`.
pub fn decode_single_at(bytes: &[u8], offset: usize) -> Result<f32> {
    Ok(f32::from_be_bytes(take_array(bytes, offset)?))
}

pub fn decode_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_be_bytes(take_array(bytes, offset)?))
}

pub fn decode_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_be_bytes(take_array(bytes, offset)?))
}

/// Fold up to 8 bytes into an unsigned integer, most significant first.
pub fn decode_uint_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Read the byte at `offset`, failing with a decode error when the response is too short.
pub fn byte_at(bytes: &[u8], offset: usize) -> Result<u8> {
    bytes.get(offset).copied().ok_or_else(|| {
        DriverError::Decode(format!(
            "expected at least {} bytes, got {}",
            offset + 1,
            bytes.len()
        ))
    })
}

/// Copy `N` bytes starting at `offset` into an array.
pub fn take_array<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    bytes
        .get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| {
            DriverError::Decode(format!(
                "expected {} bytes at offset {}, response has {}",
                N,
                offset,
                bytes.len()
            ))
        })
}
