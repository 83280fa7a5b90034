//! TCP SST - multiplexed streams over parallel sockets.
//!
//! This library carries many independent logical streams over a pool of N
//! TCP sockets between two peers, with per-message reliability and
//! WebSocket interop for browser clients.
//!
//! # Architecture
//!
//! The transport follows a connector/acceptor model:
//!
//! - **Connector**: Dials N sockets, sends a native header on each
//! - **Acceptor**: Groups sockets by connection UUID, replies once all arrived
//!
//! Key design principles:
//!
//! - Each [`LogicalStream`] is one ordered channel; clones are cheap
//! - Ordered traffic sticks to one socket; unordered traffic spreads out
//! - Closing a stream is acknowledged on every socket before its ID is reused
//! - Callback driven; a receive callback can pause its socket
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//!
//! use tcpsst::{
//!     LogicalStream, ReceivedResponse, Reliability, Result, SstListener, SstOptions,
//!     StreamCallbacks, SubstreamCallback,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Dropping a stream closes it, so accepted streams are kept.
//!     let accepted = Arc::new(Mutex::new(Vec::new()));
//!     let keep = Arc::clone(&accepted);
//!     let on_stream: SubstreamCallback = Arc::new(move |stream: LogicalStream| {
//!         if let Ok(mut streams) = keep.lock() {
//!             streams.push(stream);
//!         }
//!         Some(StreamCallbacks::new().on_received(|payload| {
//!             println!("server got {} bytes", payload.len());
//!             ReceivedResponse::Accepted
//!         }))
//!     });
//!     let listener = SstListener::bind("127.0.0.1:0", SstOptions::new(), on_stream).await?;
//!
//!     let options = SstOptions::new().with_parallel_sockets(4);
//!     let stream = tcpsst::connect(
//!         &listener.local_addr().to_string(),
//!         options,
//!         None,
//!         StreamCallbacks::new().on_status(|status, reason| println!("{status}: {reason}")),
//!     )?;
//!
//!     stream.send(b"hello", Reliability::ReliableOrdered);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Connection UUIDs and stream IDs |
//! | [`options`] | Transport options |
//! | [`protocol`] | Wire formats (internal) |
//! | [`stream`] | Logical streams and callbacks |
//! | [`transport`] | Sockets, handshakes and routing (internal) |
//!
//! # Features
//!
//! - **Parallel sockets**: Up to 99 sockets per connection
//! - **Reliability classes**: Ordered, unordered and droppable messages
//! - **WebSocket interop**: RFC6455 and hixie-76 upgrades on the same port
//! - **Backpressure**: Bounded send queues and pausable receives

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Transport options.
///
/// Use [`SstOptions::new()`] and its `with_*` builders, or load them from
/// JSON or a `--key=value` string.
pub mod options;

/// Wire formats.
///
/// Internal module defining frames, handshakes and control packets.
pub mod protocol;

/// Logical streams and their callbacks.
pub mod stream;

/// Socket transport layer.
///
/// Internal module handling dialing, accepting and multiplexing.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Stream types
pub use stream::{
    ConnectionCallback, ConnectionStatus, LogicalStream, ReadySendCallback, ReceivedCallback,
    ReceivedResponse, Reliability, StreamCallbacks, SubstreamCallback,
};

// Transport entry points
pub use transport::{Dialer, SstListener, TokioDialer, connect, connect_with, listen};

// Options
pub use options::SstOptions;

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionUuid, StreamId};
