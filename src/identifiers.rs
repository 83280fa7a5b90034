//! Type-safe identifiers for connections and streams.
//!
//! Newtype wrappers prevent mixing a stream ID with a socket index or a raw
//! length at compile time.
//!
//! | Type | Wire form | Description |
//! |------|-----------|-------------|
//! | [`ConnectionUuid`] | 16 raw bytes | Shared by all sockets of one connection |
//! | [`StreamId`] | varint | Logical stream; `0` is the control stream |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ConnectionUuid
// ============================================================================

/// 128-bit identifier shared by every physical socket of one connection.
///
/// Exchanged in each handshake so the accepting side can group sockets that
/// belong together, even when several connection attempts race on the same
/// listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionUuid(Uuid);

impl ConnectionUuid {
    /// Size of the UUID on the wire.
    pub const WIRE_SIZE: usize = 16;

    /// Generates a new random UUID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds a UUID from its 16 wire bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parses a UUID from its textual form (hyphenated or simple hex).
    #[inline]
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok().map(Self)
    }

    /// Returns the 16 wire bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns the inner UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// StreamId
// ============================================================================

/// Identifier of a logical stream within one connection.
///
/// `0` is reserved for control packets. The connecting side allocates odd
/// IDs and the accepting side even IDs, so both ends can open streams
/// without coordinating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(u32);

impl StreamId {
    /// The control stream.
    pub const CONTROL: Self = Self(0);

    /// The first stream of every connection, opened by the connecting side.
    pub const INITIAL: Self = Self(1);

    /// Largest representable stream ID (IDs are 30-bit).
    pub const MAX: u32 = (1 << 30) - 1;

    /// Creates a stream ID.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns `true` for the control stream.
    #[inline]
    #[must_use]
    pub const fn is_control(&self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the ID belongs to the odd (connecting side) space.
    #[inline]
    #[must_use]
    pub const fn is_odd(&self) -> bool {
        self.0 & 1 == 1
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

// ============================================================================
// Tests
// ============================================================================
