//! Transport options and configuration.
//!
//! Provides a type-safe interface for configuring socket count, buffer
//! sizes and delivery behaviour of a multiplexed connection.
//!
//! Options can be built fluently, loaded from JSON, or parsed from the
//! command-line style option string used by stream factories.
//!
//! # Example
//!
//! ```
//! use tcpsst::SstOptions;
//!
//! let options = SstOptions::new()
//!     .with_parallel_sockets(3)
//!     .with_unreliable_drop_chance(0.0);
//! assert!(options.validate().is_ok());
//!
//! let parsed = SstOptions::from_args("--parallel-sockets=3 --drop-chance=0").unwrap();
//! assert_eq!(parsed, options);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::frame::MAX_FRAME_HEADER_LEN;

// ============================================================================
// Constants
// ============================================================================

/// Default coalescing buffer size, sized to a typical MTU.
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 1400;

/// Default fixed receive buffer size.
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Default probability of dropping an unreliable message.
pub const DEFAULT_DROP_CHANCE: f32 = 0.25;

/// Default time allowed for a partial socket set to complete.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Default cap on the receive buffer while a frame is still incomplete.
pub const DEFAULT_MAX_FRAME_BUFFER: usize = 4 * 1024 * 1024;

/// Default cap on a WebSocket upgrade request.
pub const DEFAULT_MAX_WEBSOCKET_HEADER: usize = 8 * 1024;

/// The native header encodes the socket count in two decimal digits.
pub const MAX_PARALLEL_SOCKETS: usize = 99;

// ============================================================================
// SstOptions
// ============================================================================

/// Configuration of a multiplexed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SstOptions {
    /// Number of parallel TCP sockets per connection.
    pub parallel_sockets: usize,

    /// Size of the buffer small chunks are coalesced into before a write.
    pub send_buffer_size: usize,

    /// Size of the fixed read buffer of each socket.
    pub receive_buffer_size: usize,

    /// Frames at least this large are read directly into their own chunk.
    pub low_water_mark: usize,

    /// Probability of dropping an unreliable message before it is queued.
    pub unreliable_drop_chance: f32,

    /// Largest receive buffer kept while a frame is incomplete. Frames
    /// without a length prefix (zero-delimited) must fit in it.
    pub max_frame_buffer: usize,

    /// Disable Nagle's algorithm on every socket.
    pub no_delay: bool,

    /// Kernel send buffer (`SO_SNDBUF`) of every socket, 0 for the OS default.
    pub kernel_send_buffer_size: u32,

    /// Kernel receive buffer (`SO_RCVBUF`) of every socket, 0 for the OS default.
    pub kernel_receive_buffer_size: u32,

    /// Milliseconds the accepting side waits for a socket set to complete.
    pub handshake_timeout_ms: u64,

    /// Largest WebSocket upgrade request accepted, in bytes.
    pub max_websocket_header: usize,

    /// Per-socket queued byte bound reported by `can_send` (0 = unbounded).
    pub max_queued_bytes: usize,
}

impl Default for SstOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl SstOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            parallel_sockets: 1,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            low_water_mark: DEFAULT_RECEIVE_BUFFER_SIZE,
            unreliable_drop_chance: DEFAULT_DROP_CHANCE,
            max_frame_buffer: DEFAULT_MAX_FRAME_BUFFER,
            no_delay: true,
            kernel_send_buffer_size: 0,
            kernel_receive_buffer_size: 0,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            max_websocket_header: DEFAULT_MAX_WEBSOCKET_HEADER,
            max_queued_bytes: 0,
        }
    }

    /// Loads options from a JSON document. Missing fields take defaults,
    /// except a missing `low_water_mark`, which follows
    /// `receive_buffer_size`.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if the resulting options are invalid
    pub fn from_json(json: &str) -> Result<Self> {
        let document: serde_json::Value = serde_json::from_str(json)?;
        let low_water_mark_set = document.get("low_water_mark").is_some();

        let mut options: Self = serde_json::from_value(document)?;
        if !low_water_mark_set {
            options.low_water_mark = options.receive_buffer_size;
        }

        options.validate()?;
        Ok(options)
    }

    /// Parses a `--key=value` option string.
    ///
    /// Recognised keys:
    ///
    /// | Key | Field |
    /// |-----|-------|
    /// | `parallel-sockets` | `parallel_sockets` |
    /// | `send-buffer-size` | `send_buffer_size` |
    /// | `receive-buffer-size` | `receive_buffer_size` |
    /// | `low-water-mark` | `low_water_mark` |
    /// | `max-frame-buffer` | `max_frame_buffer` |
    /// | `drop-chance` | `unreliable_drop_chance` |
    /// | `no-delay` | `no_delay` |
    /// | `ksend-buffer-size` | `kernel_send_buffer_size` |
    /// | `kreceive-buffer-size` | `kernel_receive_buffer_size` |
    /// | `handshake-timeout-ms` | `handshake_timeout_ms` |
    /// | `max-websocket-header` | `max_websocket_header` |
    /// | `max-queued-bytes` | `max_queued_bytes` |
    ///
    /// `--base64` and `--base64=false` are accepted; enabling it is rejected
    /// because native connections always use length-prefixed frames and the
    /// base64 framing is chosen by WebSocket clients during their handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on unknown keys, unparsable values, or
    /// invalid resulting options.
    pub fn from_args(args: &str) -> Result<Self> {
        let mut options = Self::new();
        let mut low_water_mark_set = false;

        for token in args.split_whitespace() {
            let token = token
                .strip_prefix("--")
                .ok_or_else(|| Error::config(format!("Expected --key=value, got '{token}'")))?;
            let (key, value) = token.split_once('=').unwrap_or((token, "true"));

            match key {
                "parallel-sockets" => options.parallel_sockets = parse_value(key, value)?,
                "send-buffer-size" => options.send_buffer_size = parse_value(key, value)?,
                "receive-buffer-size" => options.receive_buffer_size = parse_value(key, value)?,
                "low-water-mark" => {
                    options.low_water_mark = parse_value(key, value)?;
                    low_water_mark_set = true;
                }
                "max-frame-buffer" => options.max_frame_buffer = parse_value(key, value)?,
                "drop-chance" => options.unreliable_drop_chance = parse_value(key, value)?,
                "no-delay" => options.no_delay = parse_value(key, value)?,
                "ksend-buffer-size" => options.kernel_send_buffer_size = parse_value(key, value)?,
                "kreceive-buffer-size" => {
                    options.kernel_receive_buffer_size = parse_value(key, value)?;
                }
                "base64" => {
                    if parse_value::<bool>(key, value)? {
                        return Err(Error::config(
                            "--base64 cannot be set on native connections; \
                             WebSocket clients select it during the handshake",
                        ));
                    }
                }
                "handshake-timeout-ms" => options.handshake_timeout_ms = parse_value(key, value)?,
                "max-websocket-header" => options.max_websocket_header = parse_value(key, value)?,
                "max-queued-bytes" => options.max_queued_bytes = parse_value(key, value)?,
                _ => return Err(Error::config(format!("Unknown option '--{key}'"))),
            }
        }

        if !low_water_mark_set {
            options.low_water_mark = options.receive_buffer_size;
        }

        options.validate()?;
        Ok(options)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl SstOptions {
    /// Sets the number of parallel sockets.
    #[inline]
    #[must_use]
    pub fn with_parallel_sockets(mut self, count: usize) -> Self {
        self.parallel_sockets = count;
        self
    }

    /// Sets the coalescing buffer size.
    #[inline]
    #[must_use]
    pub fn with_send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = size;
        self
    }

    /// Sets the fixed receive buffer size and resets the low water mark to it.
    #[inline]
    #[must_use]
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self.low_water_mark = size;
        self
    }

    /// Sets the large-chunk threshold.
    #[inline]
    #[must_use]
    pub fn with_low_water_mark(mut self, size: usize) -> Self {
        self.low_water_mark = size;
        self
    }

    /// Sets the unreliable drop probability.
    #[inline]
    #[must_use]
    pub fn with_unreliable_drop_chance(mut self, chance: f32) -> Self {
        self.unreliable_drop_chance = chance;
        self
    }

    /// Caps the receive buffer used for incomplete frames.
    #[inline]
    #[must_use]
    pub fn with_max_frame_buffer(mut self, size: usize) -> Self {
        self.max_frame_buffer = size;
        self
    }

    /// Sets the kernel send and receive buffer sizes, 0 keeping the OS default.
    #[inline]
    #[must_use]
    pub fn with_kernel_buffer_sizes(mut self, send: u32, receive: u32) -> Self {
        self.kernel_send_buffer_size = send;
        self.kernel_receive_buffer_size = receive;
        self
    }

    /// Enables or disables `TCP_NODELAY`.
    #[inline]
    #[must_use]
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// Sets the handshake completion timeout.
    #[inline]
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the per-socket queued byte bound.
    #[inline]
    #[must_use]
    pub fn with_max_queued_bytes(mut self, bytes: usize) -> Self {
        self.max_queued_bytes = bytes;
        self
    }
}

// ============================================================================
// Accessors & Validation
// ============================================================================

impl SstOptions {
    /// Returns the handshake timeout as a [`Duration`].
    #[inline]
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Validates the option values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.parallel_sockets == 0 || self.parallel_sockets > MAX_PARALLEL_SOCKETS {
            return Err(Error::config(format!(
                "parallel_sockets must be in 1..={MAX_PARALLEL_SOCKETS}, got {}",
                self.parallel_sockets
            )));
        }
        if self.send_buffer_size == 0 {
            return Err(Error::config("send_buffer_size must be non-zero"));
        }
        if self.receive_buffer_size <= MAX_FRAME_HEADER_LEN {
            return Err(Error::config(format!(
                "receive_buffer_size must exceed {MAX_FRAME_HEADER_LEN} bytes"
            )));
        }
        if self.low_water_mark <= MAX_FRAME_HEADER_LEN
            || self.low_water_mark > self.receive_buffer_size
        {
            return Err(Error::config(format!(
                "low_water_mark must be in {}..={}, got {}",
                MAX_FRAME_HEADER_LEN + 1,
                self.receive_buffer_size,
                self.low_water_mark
            )));
        }
        if self.max_frame_buffer < self.receive_buffer_size {
            return Err(Error::config(format!(
                "max_frame_buffer must be at least receive_buffer_size ({}), got {}",
                self.receive_buffer_size, self.max_frame_buffer
            )));
        }
        if !(0.0..=1.0).contains(&self.unreliable_drop_chance) {
            return Err(Error::config("unreliable_drop_chance must be within 0.0..=1.0"));
        }
        if self.max_websocket_header < 64 {
            return Err(Error::config("max_websocket_header must be at least 64 bytes"));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::config(format!("Invalid value '{value}' for --{key}")))
}

// ============================================================================
// Tests
// ============================================================================
