//! Error types for the SST transport.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! Synchronous misuse (invalid options, bind failures, calls made outside a
//! tokio runtime) is reported through [`Result<T>`]. Asynchronous failures of a
//! live connection are reported through the stream's connection-status
//! callback instead, exactly once per connection.
//!
//! ```ignore
//! use tcpsst::{Result, SstOptions};
//!
//! fn options() -> Result<SstOptions> {
//!     SstOptions::from_args("--parallel-sockets=3")
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionFailed`], [`Error::Disconnected`] |
//! | Handshake | [`Error::Handshake`], [`Error::HandshakeTimeout`] |
//! | Protocol | [`Error::Protocol`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::Url`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when transport options are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection could not be set up.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Every candidate address failed for at least one socket slot.
    #[error("Connection failed on socket {socket}: {message}")]
    ConnectionFailed {
        /// Slot index of the socket that failed.
        socket: usize,
        /// Description of the failure.
        message: String,
    },

    /// A live socket of the connection failed or was closed by the peer.
    #[error("Disconnected: {message}")]
    Disconnected {
        /// Description of the disconnect.
        message: String,
    },

    // ========================================================================
    // Handshake Errors
    // ========================================================================
    /// Handshake header was malformed or disagreed with its siblings.
    #[error("Handshake error: {message}")]
    Handshake {
        /// Description of the handshake error.
        message: String,
    },

    /// A partial socket set was not completed in time.
    #[error("Handshake timeout after {timeout_ms}ms")]
    HandshakeTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Frame or control packet could not be parsed.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON (options) error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request target could not be parsed.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection failed error for a socket slot.
    #[inline]
    pub fn connection_failed(socket: usize, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            socket,
            message: message.into(),
        }
    }

    /// Creates a disconnect error.
    #[inline]
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::Disconnected {
            message: message.into(),
        }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates a handshake timeout error.
    #[inline]
    pub fn handshake_timeout(timeout_ms: u64) -> Self {
        Self::HandshakeTimeout { timeout_ms }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this error ends a connection.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionFailed { .. }
                | Self::Disconnected { .. }
                | Self::Io(_)
        )
    }

    /// Returns `true` if this is a handshake error.
    #[inline]
    #[must_use]
    pub fn is_handshake_error(&self) -> bool {
        matches!(self, Self::Handshake { .. } | Self::HandshakeTimeout { .. })
    }

    /// Returns `true` if this is a frame-level protocol error.
    ///
    /// Protocol errors drop the offending packet but leave the socket up.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
