//! Socket transport layer.
//!
//! This module owns the sockets: dialing and accepting them, running the
//! handshakes, and moving frames between sockets and logical streams.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            MultiplexedConnection             │
//! │  streams 1, 2, 3 ... ──► route by stream ID  │
//! │  ┌──────────┐ ┌──────────┐     ┌──────────┐  │
//! │  │ socket 0 │ │ socket 1 │ ... │ socket N │  │
//! │  │ Send     │ │ Send     │     │ Send     │  │
//! │  │ Receive  │ │ Receive  │     │ Receive  │  │
//! │  └──────────┘ └──────────┘     └──────────┘  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `connect` / `SstListener::bind` - Dial or accept N sockets
//! 2. Exchange native headers or a WebSocket upgrade per socket
//! 3. `MultiplexedConnection::establish` - Start one send and one receive path per socket
//! 4. Streams send, receive and open substreams
//! 5. Last stream dropped or a socket fails - Sockets closed
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connect` | Outbound dialing and native handshake |
//! | `connection` | Routing, stream registry and close protocol |
//! | `listener` | Accept loop and handshake correlation |
//! | `receive` | Per-socket read loop |
//! | `send` | Per-socket coalescing writer |

// ============================================================================
// Submodules
// ============================================================================

/// Outbound connections.
pub mod connect;

/// Multiplexed connection.
pub mod connection;

/// Inbound connections.
pub mod listener;

/// Per-socket receive path.
pub mod receive;

/// Per-socket send path.
pub mod send;

// ============================================================================
// Re-exports
// ============================================================================

pub use connect::{Dialer, TokioDialer, connect, connect_with};
pub use connection::{MultiplexedConnection, Role};
pub use listener::{SstListener, listen};
