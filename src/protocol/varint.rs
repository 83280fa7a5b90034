//! Variable-length integer codec.
//!
//! Lengths and stream IDs on the native wire are little-endian base-128
//! integers: seven value bits per byte, high bit set on every byte except the
//! last. Values are bounded to 30 bits, so an encoding never exceeds five
//! bytes.
//!
//! | Value range | Encoded size |
//! |-------------|--------------|
//! | `0..2^7` | 1 byte |
//! | `2^7..2^14` | 2 bytes |
//! | `2^14..2^21` | 3 bytes |
//! | `2^21..2^28` | 4 bytes |
//! | `2^28..2^30` | 5 bytes |

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};
use crate::identifiers::StreamId;

// ============================================================================
// Constants
// ============================================================================

/// Largest value a varint may carry.
pub const MAX_VARINT: u32 = (1 << 30) - 1;

/// Longest encoding of a varint.
pub const MAX_VARINT_LEN: usize = 5;

const CONTINUATION: u8 = 0x80;
const VALUE_BITS: u8 = 0x7F;

// ============================================================================
// Encoding
// ============================================================================

/// Returns the number of bytes `value` occupies on the wire.
#[inline]
#[must_use]
pub const fn varint_size(value: u32) -> usize {
    match value {
        0..0x80 => 1,
        0x80..0x4000 => 2,
        0x4000..0x20_0000 => 3,
        0x20_0000..0x1000_0000 => 4,
        _ => 5,
    }
}

/// Appends the encoding of `value` to `out`.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if `value` exceeds [`MAX_VARINT`].
pub fn encode_varint(value: u32, out: &mut Vec<u8>) -> Result<()> {
    if value > MAX_VARINT {
        return Err(Error::protocol(format!(
            "Varint value {value} exceeds {MAX_VARINT}"
        )));
    }

    let mut remaining = value;
    loop {
        let byte = (remaining as u8) & VALUE_BITS;
        remaining >>= 7;
        if remaining == 0 {
            out.push(byte);
            return Ok(());
        }
        out.push(byte | CONTINUATION);
    }
}

/// Appends a frame length prefix to `out`.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if `len` exceeds [`MAX_VARINT`].
#[inline]
pub fn encode_len(len: usize, out: &mut Vec<u8>) -> Result<()> {
    let value = u32::try_from(len)
        .map_err(|_| Error::protocol(format!("Frame length {len} is not representable")))?;
    encode_varint(value, out)
}

/// Appends a stream ID to `out`.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the ID exceeds [`StreamId::MAX`].
#[inline]
pub fn encode_stream_id(id: StreamId, out: &mut Vec<u8>) -> Result<()> {
    encode_varint(id.as_u32(), out)
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes a varint from the start of `buf`.
///
/// Returns `Ok(None)` if `buf` ends before the encoding does, otherwise the
/// value and the number of bytes consumed.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the encoding runs past five bytes or the
/// value exceeds [`MAX_VARINT`].
pub fn decode_varint(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value: u32 = 0;

    for (index, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        // Only two value bits remain for the fifth byte.
        if index == MAX_VARINT_LEN - 1 && byte & VALUE_BITS > 0x03 {
            return Err(Error::protocol(format!("Varint value exceeds {MAX_VARINT}")));
        }
        value |= u32::from(byte & VALUE_BITS) << (7 * index);

        if byte & CONTINUATION == 0 {
            return Ok(Some((value, index + 1)));
        }
    }

    if buf.len() >= MAX_VARINT_LEN {
        return Err(Error::protocol("Varint longer than 5 bytes"));
    }
    Ok(None)
}

/// Decodes a frame length prefix.
///
/// # Errors
///
/// See [`decode_varint`].
#[inline]
pub fn decode_len(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    Ok(decode_varint(buf)?.map(|(value, used)| (value as usize, used)))
}

/// Decodes a stream ID.
///
/// # Errors
///
/// See [`decode_varint`].
#[inline]
pub fn decode_stream_id(buf: &[u8]) -> Result<Option<(StreamId, usize)>> {
    Ok(decode_varint(buf)?.map(|(value, used)| (StreamId::new(value), used)))
}

// ============================================================================
// Tests
// ============================================================================
