//! Application-facing logical streams.
//!
//! A [`LogicalStream`] is one independently ordered channel of a
//! multiplexed connection. Streams are cheap: cloning one allocates a new
//! stream ID on the same sockets.
//!
//! # Callbacks
//!
//! | Callback | Fired when |
//! |----------|------------|
//! | [`ConnectionCallback`] | Connected, connection failed, or disconnected |
//! | [`ReceivedCallback`] | A payload arrived; may pause the socket |
//! | [`ReadySendCallback`] | A previously full send queue drained |
//! | [`SubstreamCallback`] | The peer opened a new stream |
//!
//! Callbacks run on the runtime's worker threads and must not block.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::identifiers::{ConnectionUuid, StreamId};
use crate::transport::connection::MultiplexedConnection;

// ============================================================================
// Constants
// ============================================================================

/// Set in the send status once a close has begun.
const CLOSING: u32 = 1 << 31;

// ============================================================================
// Enums
// ============================================================================

/// Delivery class of one message.
///
/// Unreliable ordered delivery is deliberately not offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    /// Delivered in send order, on the stream's fixed socket.
    ReliableOrdered,
    /// Delivered, on whichever socket is least busy.
    ReliableUnordered,
    /// May be dropped before it is queued; unordered.
    Unreliable,
}

impl Reliability {
    /// Returns `true` if the message must keep its stream's socket.
    #[inline]
    #[must_use]
    pub const fn is_ordered(self) -> bool {
        matches!(self, Self::ReliableOrdered)
    }
}

/// Connection status reported to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Every socket completed its handshake.
    Connected,
    /// The connection could not be established.
    ConnectionFailed,
    /// The connection or this stream was closed.
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("Connected"),
            Self::ConnectionFailed => f.write_str("ConnectionFailed"),
            Self::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// Answer of a [`ReceivedCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceivedResponse {
    /// The payload was consumed.
    Accepted,
    /// Stop reading this socket; the same payload is delivered again after
    /// [`LogicalStream::ready_read`].
    Paused,
}

// ============================================================================
// Callback Types
// ============================================================================

/// Connection status callback: status plus a reason.
pub type ConnectionCallback = Arc<dyn Fn(ConnectionStatus, &str) + Send + Sync>;

/// Payload callback.
pub type ReceivedCallback = Arc<dyn Fn(&[u8]) -> ReceivedResponse + Send + Sync>;

/// Send-queue drained callback.
pub type ReadySendCallback = Arc<dyn Fn() + Send + Sync>;

/// New stream callback. Returning `None` declines the stream, which closes it.
pub type SubstreamCallback = Arc<dyn Fn(LogicalStream) -> Option<StreamCallbacks> + Send + Sync>;

// ============================================================================
// StreamCallbacks
// ============================================================================

/// Callbacks attached to one stream.
#[derive(Clone, Default)]
pub struct StreamCallbacks {
    pub(crate) on_status: Option<ConnectionCallback>,
    pub(crate) on_received: Option<ReceivedCallback>,
    pub(crate) on_ready_send: Option<ReadySendCallback>,
}

impl StreamCallbacks {
    /// Creates an empty set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connection status callback.
    #[must_use]
    pub fn on_status<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConnectionStatus, &str) + Send + Sync + 'static,
    {
        self.on_status = Some(Arc::new(callback));
        self
    }

    /// Sets the payload callback.
    #[must_use]
    pub fn on_received<F>(mut self, callback: F) -> Self
    where
        F: Fn(&[u8]) -> ReceivedResponse + Send + Sync + 'static,
    {
        self.on_received = Some(Arc::new(callback));
        self
    }

    /// Sets the ready-to-send callback.
    #[must_use]
    pub fn on_ready_send<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_ready_send = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCallbacks")
            .field("on_status", &self.on_status.is_some())
            .field("on_received", &self.on_received.is_some())
            .field("on_ready_send", &self.on_ready_send.is_some())
            .finish()
    }
}

// ============================================================================
// LogicalStream
// ============================================================================

/// Handle to one stream of a multiplexed connection.
///
/// Dropping the handle closes the stream. The connection's sockets are
/// released once its last stream is gone.
///
/// # Example
///
/// ```ignore
/// let stream = tcpsst::connect("127.0.0.1:9000", options, None, callbacks)?;
/// stream.send(b"hello", Reliability::ReliableOrdered);
///
/// let side = stream.clone_stream(StreamCallbacks::new()).expect("live connection");
/// side.send(b"bulk", Reliability::ReliableUnordered);
/// ```
pub struct LogicalStream {
    id: StreamId,
    connection: Arc<MultiplexedConnection>,
    /// In-flight sends, plus [`CLOSING`] once closed.
    send_status: AtomicU32,
}

impl LogicalStream {
    pub(crate) fn new(id: StreamId, connection: Arc<MultiplexedConnection>) -> Self {
        connection.stream_opened();
        Self {
            id,
            connection,
            send_status: AtomicU32::new(0),
        }
    }

    /// Returns the stream ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Returns the UUID of the underlying connection.
    #[inline]
    #[must_use]
    pub fn connection_uuid(&self) -> ConnectionUuid {
        self.connection.uuid()
    }

    /// Sends one message.
    ///
    /// Returns `false` if the stream is closed, the connection is down, the
    /// payload is too large, or the routed socket's queue is full. A full
    /// queue fires the ready-to-send callback once it drains.
    pub fn send(&self, payload: &[u8], reliability: Reliability) -> bool {
        let status = self.send_status.fetch_add(1, Ordering::AcqRel);
        if status & CLOSING != 0 {
            self.send_status.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        let sent = self.connection.send_payload(self.id, payload, reliability);

        self.send_status.fetch_sub(1, Ordering::AcqRel);
        sent
    }

    /// Closes the stream.
    ///
    /// Waits for sends racing with the close, then tells the peer. Calling
    /// `close` again is a no-op.
    pub fn close(&self) {
        let status = self.send_status.fetch_or(CLOSING, Ordering::AcqRel);
        if status & CLOSING != 0 {
            return;
        }

        while self.send_status.load(Ordering::Acquire) & !CLOSING != 0 {
            std::thread::yield_now();
        }

        debug!(stream = %self.id, uuid = %self.connection.uuid(), "Closing stream");
        self.connection.close_stream(self.id);
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.send_status.load(Ordering::Acquire) & CLOSING != 0
    }

    /// Opens a new stream on the same connection.
    ///
    /// Returns `None` if the connection is down.
    #[must_use]
    pub fn clone_stream(&self, callbacks: StreamCallbacks) -> Option<LogicalStream> {
        let id = self.connection.open_stream(callbacks)?;
        Some(Self::new(id, Arc::clone(&self.connection)))
    }

    /// Returns `true` if a payload of `len` bytes would be accepted now.
    #[inline]
    #[must_use]
    pub fn can_send(&self, len: usize) -> bool {
        !self.is_closed() && self.connection.can_send(self.id, len)
    }

    /// Fires the ready-to-send callback once this stream's socket drains.
    pub fn request_ready_send(&self) {
        self.connection.request_ready_send(self.id);
    }

    /// Resumes every paused socket; paused payloads are delivered again first.
    pub fn ready_read(&self) {
        self.connection.resume_reads();
    }

    /// Address of the peer, once connected.
    #[inline]
    #[must_use]
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.connection.remote_endpoint()
    }

    /// Local address, once connected.
    #[inline]
    #[must_use]
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.connection.local_endpoint()
    }

    /// Average time this stream's messages wait in their socket's queue.
    #[inline]
    #[must_use]
    pub fn average_send_latency(&self) -> Duration {
        self.connection.average_send_latency(self.id)
    }

    /// Average time received payloads wait before a callback accepts them,
    /// pauses included. Zero until something has been delivered.
    #[inline]
    #[must_use]
    pub fn average_receive_latency(&self) -> Duration {
        self.connection.average_receive_latency()
    }
}

impl fmt::Debug for LogicalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalStream")
            .field("id", &self.id)
            .field("uuid", &self.connection.uuid())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for LogicalStream {
    fn drop(&mut self) {
        self.close();
        self.connection.stream_released();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliability_ordering() {
        assert!(Reliability::ReliableOrdered.is_ordered());
        assert!(!Reliability::ReliableUnordered.is_ordered());
        assert!(!Reliability::Unreliable.is_ordered());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::ConnectionFailed.to_string(), "ConnectionFailed");
    }

    #[test]
    fn test_callbacks_builder() {
        let callbacks = StreamCallbacks::new()
            .on_received(|_| ReceivedResponse::Accepted)
            .on_ready_send(|| {});

        assert!(callbacks.on_received.is_some());
        assert!(callbacks.on_ready_send.is_some());
        assert!(callbacks.on_status.is_none());
        assert_eq!(
            format!("{callbacks:?}"),
            "StreamCallbacks { on_status: false, on_received: true, on_ready_send: true }"
        );
    }
}
