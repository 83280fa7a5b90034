//! Wire formats.
//!
//! Everything in this module is pure byte manipulation with no I/O, so it
//! can be tested and benchmarked in isolation.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `varint` | Length and stream ID integers |
//! | `frame` | Native, WebSocket and zero-delimited frames |
//! | `control` | Close and close-acknowledge packets |
//! | `handshake` | Native header and HTTP upgrade handshakes |

// ============================================================================
// Submodules
// ============================================================================

/// Control packets on stream 0.
pub mod control;

/// Frame codecs.
pub mod frame;

/// Connection handshakes.
pub mod handshake;

/// Variable-length integers.
pub mod varint;

// ============================================================================
// Re-exports
// ============================================================================

pub use control::{ControlCode, ControlPacket};
pub use frame::{
    Decoded, Frame, FrameDecoder, FrameHeader, FrameKind, FramingStyle, MaskState, encode_frame,
};
pub use handshake::{NativeHeader, UpgradeRequest, WebSocketFlavor};
pub use varint::{decode_len, decode_stream_id, encode_len, encode_stream_id};
