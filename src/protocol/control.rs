//! Control packets carried on stream 0.
//!
//! | Code | Name | Meaning |
//! |------|------|---------|
//! | `1` | `CloseStream` | Sender closed the target stream |
//! | `2` | `AckCloseStream` | Sender saw the target stream's close |
//!
//! Payload layout: `{code}{varint target stream}`.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::error::{Error, Result};
use crate::identifiers::StreamId;
use crate::protocol::varint::{MAX_VARINT_LEN, decode_stream_id, encode_stream_id};

// ============================================================================
// ControlCode
// ============================================================================

/// Connection management code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCode {
    /// The sender closed a stream.
    CloseStream = 1,
    /// The sender acknowledges a peer's close.
    AckCloseStream = 2,
}

impl ControlCode {
    /// Returns the wire byte.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire byte.
    #[inline]
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::CloseStream),
            2 => Some(Self::AckCloseStream),
            _ => None,
        }
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CloseStream => f.write_str("CloseStream"),
            Self::AckCloseStream => f.write_str("AckCloseStream"),
        }
    }
}

// ============================================================================
// ControlPacket
// ============================================================================

/// Decoded control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPacket {
    /// What happened.
    pub code: ControlCode,
    /// Stream it happened to.
    pub target: StreamId,
}

impl ControlPacket {
    /// Creates a `CloseStream` packet.
    #[inline]
    #[must_use]
    pub const fn close(target: StreamId) -> Self {
        Self {
            code: ControlCode::CloseStream,
            target,
        }
    }

    /// Creates an `AckCloseStream` packet.
    #[inline]
    #[must_use]
    pub const fn ack(target: StreamId) -> Self {
        Self {
            code: ControlCode::AckCloseStream,
            target,
        }
    }

    /// Encodes the stream-0 payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the target ID is out of range.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + MAX_VARINT_LEN);
        out.push(self.code.as_u8());
        encode_stream_id(self.target, &mut out)?;
        Ok(out)
    }

    /// Parses a stream-0 payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on an empty, truncated or unknown packet.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (&code, rest) = payload
            .split_first()
            .ok_or_else(|| Error::protocol("Empty control packet"))?;

        let code = ControlCode::from_u8(code)
            .ok_or_else(|| Error::protocol(format!("Unknown control code {code}")))?;

        let (target, _) = decode_stream_id(rest)?
            .ok_or_else(|| Error::protocol("Truncated control packet"))?;

        if target.is_control() {
            return Err(Error::protocol(format!("{code} targets the control stream")));
        }

        Ok(Self { code, target })
    }
}

// ============================================================================
// Tests
// ============================================================================
