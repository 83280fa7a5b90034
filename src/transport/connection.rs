//! Multiplexed connection over a pool of sockets.
//!
//! A [`MultiplexedConnection`] owns the send and receive paths of its N
//! sockets, routes frames of many logical streams across them and runs the
//! close protocol on stream 0.
//!
//! # Phases
//!
//! | Phase | Sends |
//! |-------|-------|
//! | `Preconnection` | Buffered until the sockets are up |
//! | `WaitConnecting` | Buffered sends are being handed to their sockets |
//! | `Connected` | Routed directly |
//! | `Disconnected` | Refused; terminal |
//!
//! # Routing
//!
//! | Traffic | Socket |
//! |---------|--------|
//! | Stream 0 | Every socket |
//! | Ordered | `hash(stream) % N` |
//! | Unordered, unreliable | Least busy of the hashed socket and a random one |
//!
//! # Close Protocol
//!
//! Closing a stream broadcasts `CloseStream` on every socket. The peer
//! tears its side down once it has seen the close on all N sockets and
//! answers with `AckCloseStream` on every socket; the ID is reusable once
//! all N acknowledgements have arrived. Data still in flight for a stream
//! that is closing locally is discarded.

// ============================================================================
// Imports
// ============================================================================

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, MutexGuard, RwLock};
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::identifiers::{ConnectionUuid, StreamId};
use crate::options::SstOptions;
use crate::protocol::control::{ControlCode, ControlPacket};
use crate::protocol::frame::{
    FrameDecoder, FramingStyle, encode_delimited_close, encode_frame, encode_websocket_frame, opcode,
};
use crate::stream::{
    ConnectionCallback, ConnectionStatus, LogicalStream, ReadySendCallback, ReceivedResponse,
    Reliability, StreamCallbacks, SubstreamCallback,
};
use crate::transport::receive::{ChunkSink, ReadControl, ReceivePath};
use crate::transport::send::{PendingChunk, SendObserver, SendPath};

// ============================================================================
// Constants
// ============================================================================

const PRECONNECTION: u8 = 0;
const WAIT_CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;
const DISCONNECTED: u8 = 3;

/// Reason reported when the peer closes a stream.
const REMOTE_CLOSE_REASON: &str = "Remote Host Disconnected";

// ============================================================================
// Types
// ============================================================================

/// Read half of one socket.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of one socket.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which end of the connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dialed out; allocates odd stream IDs.
    Connector,
    /// Accepted; allocates even stream IDs.
    Acceptor,
}

/// A handshaken socket, ready to join a connection.
pub struct SocketParts {
    /// Read half.
    pub reader: BoxedReader,
    /// Write half.
    pub writer: BoxedWriter,
    /// Local address, if known.
    pub local_addr: Option<SocketAddr>,
    /// Peer address, if known.
    pub peer_addr: Option<SocketAddr>,
    /// Bytes read past the handshake.
    pub leftover: Vec<u8>,
}

impl SocketParts {
    /// Splits a TCP stream.
    #[must_use]
    pub fn from_tcp(stream: TcpStream, leftover: Vec<u8>) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            local_addr,
            peer_addr,
            leftover,
        }
    }

    /// Splits any bidirectional stream, without addresses.
    #[must_use]
    pub fn from_io<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            local_addr: None,
            peer_addr: None,
            leftover: Vec::new(),
        }
    }
}

impl std::fmt::Debug for SocketParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketParts")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("leftover", &self.leftover.len())
            .finish_non_exhaustive()
    }
}

/// One established socket.
struct SocketSlot {
    send: Arc<SendPath<BoxedWriter>>,
    read: Arc<ReadControl>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

/// Stream callbacks and close bookkeeping.
#[derive(Default)]
struct StreamRegistry {
    entries: FxHashMap<StreamId, StreamCallbacks>,
    /// Streams closed locally and waiting for the peer's acknowledgements.
    one_sided_closing: FxHashSet<StreamId>,
    /// Control packets seen so far, per target and code.
    control_counts: FxHashMap<(StreamId, ControlCode), usize>,
}

// ============================================================================
// MultiplexedConnection
// ============================================================================

/// N sockets carrying many logical streams.
pub struct MultiplexedConnection {
    me: Weak<MultiplexedConnection>,
    uuid: ConnectionUuid,
    role: Role,
    style: FramingStyle,
    options: SstOptions,
    runtime: Handle,
    phase: AtomicU8,
    /// Sends made before the sockets are up. The lock also guards phase changes.
    pending: Mutex<Vec<PendingChunk>>,
    sockets: RwLock<Vec<SocketSlot>>,
    registry: Mutex<StreamRegistry>,
    /// Registrations from application threads, committed on the next registry access.
    registrations: SegQueue<(StreamId, StreamCallbacks)>,
    free_ids: SegQueue<StreamId>,
    highest: AtomicU32,
    live_streams: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    substream: Option<SubstreamCallback>,
}

impl MultiplexedConnection {
    /// Creates a connection in the pre-connection phase.
    ///
    /// `options.parallel_sockets` must equal the number of sockets later
    /// passed to [`establish`](Self::establish).
    pub(crate) fn new(
        uuid: ConnectionUuid,
        role: Role,
        style: FramingStyle,
        options: SstOptions,
        runtime: Handle,
        substream: Option<SubstreamCallback>,
    ) -> Arc<Self> {
        let highest = match role {
            Role::Connector => StreamId::INITIAL.as_u32(),
            Role::Acceptor => 0,
        };

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            uuid,
            role,
            style,
            options,
            runtime,
            phase: AtomicU8::new(PRECONNECTION),
            pending: Mutex::new(Vec::new()),
            sockets: RwLock::new(Vec::new()),
            registry: Mutex::new(StreamRegistry::default()),
            registrations: SegQueue::new(),
            free_ids: SegQueue::new(),
            highest: AtomicU32::new(highest),
            live_streams: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
            substream,
        })
    }

    /// Returns the connection UUID.
    #[inline]
    #[must_use]
    pub fn uuid(&self) -> ConnectionUuid {
        self.uuid
    }

    /// Returns this end's role.
    #[inline]
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the framing style.
    #[inline]
    #[must_use]
    pub fn style(&self) -> FramingStyle {
        self.style
    }

    /// Returns `true` once every socket is up and the connection is live.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase.load(Ordering::Acquire) == CONNECTED
    }

    /// Returns `true` once the connection has shut down.
    #[inline]
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.phase.load(Ordering::Acquire) == DISCONNECTED
    }

    /// Tracks a background task, aborted when the connection goes down.
    pub(crate) fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.push(handle);
        if self.is_disconnected() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    // ========================================================================
    // Establishment
    // ========================================================================

    /// Installs the sockets, flushes buffered sends and starts reading.
    ///
    /// Returns `false`, shutting the sockets down, if the connection was
    /// closed or failed in the meantime.
    pub(crate) fn establish(&self, parts: Vec<SocketParts>) -> bool {
        let Some(this) = self.me.upgrade() else {
            return false;
        };
        let observer: Weak<dyn SendObserver> = self.me.clone();

        let mut slots = Vec::with_capacity(parts.len());
        let mut readers = Vec::with_capacity(parts.len());
        for (index, part) in parts.into_iter().enumerate() {
            let send = SendPath::new(
                index,
                part.writer,
                self.options.send_buffer_size,
                self.options.max_queued_bytes,
                self.runtime.clone(),
                observer.clone(),
            );
            let read = Arc::new(ReadControl::new());
            readers.push((index, part.reader, part.leftover, Arc::clone(&read)));
            slots.push(SocketSlot {
                send,
                read,
                local_addr: part.local_addr,
                peer_addr: part.peer_addr,
            });
        }
        let sockets = slots.len();

        {
            let mut pending = self.pending.lock();
            if self.phase.load(Ordering::Acquire) != PRECONNECTION {
                drop(pending);
                debug!(uuid = %self.uuid, "Connection closed before establishment");
                for slot in &slots {
                    slot.send.shutdown();
                }
                return false;
            }

            *self.sockets.write() = slots;
            self.phase.store(WAIT_CONNECTING, Ordering::Release);
            let buffered = pending.len();
            for chunk in pending.drain(..) {
                self.route(chunk, true);
            }
            self.phase.store(CONNECTED, Ordering::Release);
            trace!(uuid = %self.uuid, buffered, "Flushed buffered sends");
        }

        let decoder = FrameDecoder::new(self.style);
        for (index, reader, leftover, read) in readers {
            let path = ReceivePath::new(index, reader, decoder.clone(), &self.options, read)
                .with_initial(&leftover);
            self.track_task(self.runtime.spawn(path.run(Arc::clone(&this))));
        }

        info!(
            uuid = %self.uuid,
            role = ?self.role,
            style = ?self.style,
            sockets,
            "Connection established"
        );

        if self.role == Role::Connector {
            self.notify_status(ConnectionStatus::Connected, "Connected");
        }
        true
    }

    // ========================================================================
    // Streams
    // ========================================================================

    /// Queues callbacks for `stream_id`.
    pub(crate) fn register(&self, stream_id: StreamId, callbacks: StreamCallbacks) {
        self.registrations.push((stream_id, callbacks));
    }

    /// Allocates an ID for a new local stream and registers its callbacks.
    ///
    /// Returns `None` once the connection is down or IDs are exhausted.
    pub(crate) fn open_stream(&self, callbacks: StreamCallbacks) -> Option<StreamId> {
        if self.is_disconnected() {
            return None;
        }
        let stream_id = self.allocate_id()?;
        self.register(stream_id, callbacks);
        debug!(uuid = %self.uuid, stream = %stream_id, "Opened stream");
        Some(stream_id)
    }

    /// Hands the peer-opened `stream_id` to the substream callback.
    ///
    /// The registry must already hold a placeholder entry for it. `payload`
    /// is the first chunk that revealed the stream, if any.
    pub(crate) fn accept_substream(
        &self,
        stream_id: StreamId,
        payload: Option<&[u8]>,
    ) -> ReceivedResponse {
        let (Some(connection), Some(on_stream)) = (self.me.upgrade(), self.substream.clone())
        else {
            debug!(uuid = %self.uuid, stream = %stream_id, "No substream handler, closing");
            self.close_stream(stream_id);
            return ReceivedResponse::Accepted;
        };

        let stream = LogicalStream::new(stream_id, connection);
        let Some(callbacks) = on_stream(stream) else {
            debug!(uuid = %self.uuid, stream = %stream_id, "Substream declined");
            self.close_stream(stream_id);
            return ReceivedResponse::Accepted;
        };

        let on_received = callbacks.on_received.clone();
        {
            let mut registry = self.registry();
            match registry.entries.get_mut(&stream_id) {
                Some(entry) => *entry = callbacks,
                None => return ReceivedResponse::Accepted,
            }
        }

        match (payload, on_received) {
            (Some(payload), Some(on_received)) => on_received(payload),
            _ => ReceivedResponse::Accepted,
        }
    }

    /// Inserts an empty entry so data racing with the substream callback is
    /// not mistaken for yet another new stream.
    pub(crate) fn reserve_substream(&self, stream_id: StreamId) {
        self.registry()
            .entries
            .insert(stream_id, StreamCallbacks::default());
    }

    /// Starts closing `stream_id`. Idempotent.
    pub(crate) fn close_stream(&self, stream_id: StreamId) {
        let removed = {
            let mut registry = self.registry();
            let removed = registry.entries.remove(&stream_id);
            if removed.is_some() {
                registry.one_sided_closing.insert(stream_id);
            }
            removed
        };

        if removed.is_some() {
            debug!(uuid = %self.uuid, stream = %stream_id, "Sending close");
            self.send_control(ControlPacket::close(stream_id));
        }
    }

    pub(crate) fn stream_opened(&self) {
        self.live_streams.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one stream handle; the last one closes the sockets.
    pub(crate) fn stream_released(&self) {
        if self.live_streams.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.release();
        }
    }

    fn allocate_id(&self) -> Option<StreamId> {
        if let Some(stream_id) = self.free_ids.pop() {
            return Some(stream_id);
        }
        let next = self.highest.fetch_add(2, Ordering::AcqRel) + 2;
        (next <= StreamId::MAX).then(|| StreamId::new(next))
    }

    fn release_id(&self, stream_id: StreamId) {
        let local = match self.role {
            Role::Connector => stream_id.is_odd(),
            Role::Acceptor => !stream_id.is_odd(),
        };
        if local && !stream_id.is_control() {
            trace!(uuid = %self.uuid, stream = %stream_id, "Stream ID recycled");
            self.free_ids.push(stream_id);
        }
    }

    /// Locks the registry after committing queued registrations.
    fn registry(&self) -> MutexGuard<'_, StreamRegistry> {
        let mut registry = self.registry.lock();
        while let Some((stream_id, callbacks)) = self.registrations.pop() {
            registry.entries.insert(stream_id, callbacks);
        }
        registry
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Frames and routes one payload.
    pub(crate) fn send_payload(
        &self,
        stream_id: StreamId,
        payload: &[u8],
        reliability: Reliability,
    ) -> bool {
        if reliability == Reliability::Unreliable
            && rand::random::<f32>() < self.options.unreliable_drop_chance
        {
            trace!(stream = %stream_id, len = payload.len(), "Dropped unreliable message");
            return true;
        }

        let mut data = Vec::new();
        if let Err(e) = encode_frame(self.style, stream_id, payload, &mut data) {
            warn!(stream = %stream_id, error = %e, "Cannot frame payload");
            return false;
        }

        self.submit(PendingChunk::new(stream_id, reliability, data), false)
    }

    fn send_control(&self, packet: ControlPacket) {
        let framed = packet.to_payload().and_then(|payload| {
            let mut data = Vec::new();
            encode_frame(self.style, StreamId::CONTROL, &payload, &mut data)?;
            Ok(data)
        });

        match framed {
            Ok(data) => {
                let chunk = PendingChunk::new(StreamId::CONTROL, Reliability::ReliableOrdered, data);
                if !self.submit(chunk, true) {
                    trace!(uuid = %self.uuid, code = %packet.code, "Control packet not sent");
                }
            }
            Err(e) => warn!(error = %e, "Cannot frame control packet"),
        }
    }

    fn submit(&self, chunk: PendingChunk, force: bool) -> bool {
        if self.is_connected() {
            return self.route(chunk, force);
        }

        let mut pending = self.pending.lock();
        match self.phase.load(Ordering::Acquire) {
            PRECONNECTION => {
                pending.push(chunk);
                true
            }
            CONNECTED => {
                drop(pending);
                self.route(chunk, force)
            }
            _ => false,
        }
    }

    fn route(&self, chunk: PendingChunk, force: bool) -> bool {
        let sockets = self.sockets.read();
        if sockets.is_empty() {
            return false;
        }

        if chunk.stream_id.is_control() {
            return sockets
                .iter()
                .fold(true, |sent, slot| slot.send.enqueue(chunk.clone(), true) && sent);
        }

        let favored = stream_slot(chunk.stream_id, sockets.len());
        let index = if chunk.reliability.is_ordered() {
            favored
        } else {
            least_busy(&sockets, favored)
        };
        sockets[index].send.enqueue(chunk, force)
    }

    /// Returns `true` if `stream_id`'s socket would take `len` more bytes.
    pub(crate) fn can_send(&self, stream_id: StreamId, len: usize) -> bool {
        match self.phase.load(Ordering::Acquire) {
            CONNECTED => {
                let sockets = self.sockets.read();
                sockets
                    .get(stream_slot(stream_id, sockets.len()))
                    .is_some_and(|slot| slot.send.can_send(len))
            }
            DISCONNECTED => false,
            _ => true,
        }
    }

    /// Fires `stream_id`'s ready-to-send callback once its socket drains.
    pub(crate) fn request_ready_send(&self, stream_id: StreamId) {
        if self.is_connected() {
            let sockets = self.sockets.read();
            if let Some(slot) = sockets.get(stream_slot(stream_id, sockets.len())) {
                slot.send.request_ready_send(stream_id);
                return;
            }
        }
        if !self.is_disconnected() {
            // Sends are buffered without limit before the sockets are up.
            self.notify_ready(&[stream_id]);
        }
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Wakes the receive paths that are paused. Running paths are untouched.
    pub(crate) fn resume_reads(&self) {
        for (socket, slot) in self.sockets.read().iter().enumerate() {
            if slot.read.resume() {
                trace!(uuid = %self.uuid, socket, "Resuming paused socket");
            }
        }
    }

    fn handle_control(&self, socket: usize, payload: &[u8]) {
        let packet = match ControlPacket::parse(payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(socket, error = %e, "Dropping malformed control packet");
                return;
            }
        };

        let target = packet.target;
        let mut registry = self.registry();
        let seen = registry
            .control_counts
            .entry((target, packet.code))
            .or_insert(0);
        *seen += 1;
        if *seen < self.options.parallel_sockets {
            trace!(socket, stream = %target, code = %packet.code, seen = *seen, "Control packet counted");
            return;
        }
        registry.control_counts.remove(&(target, packet.code));

        match packet.code {
            ControlCode::CloseStream => {
                let callbacks = registry.entries.remove(&target);
                let closing_locally = registry.one_sided_closing.contains(&target);
                drop(registry);

                debug!(uuid = %self.uuid, stream = %target, "Peer closed stream");
                if let Some(on_status) = callbacks.and_then(|callbacks| callbacks.on_status) {
                    on_status(ConnectionStatus::Disconnected, REMOTE_CLOSE_REASON);
                }
                // A simultaneous close frees the ID once our own close is acknowledged.
                if !closing_locally {
                    self.release_id(target);
                }
                self.send_control(ControlPacket::ack(target));
            }
            ControlCode::AckCloseStream => {
                let was_closing = registry.one_sided_closing.remove(&target);
                drop(registry);

                if was_closing {
                    debug!(uuid = %self.uuid, stream = %target, "Stream close acknowledged");
                    self.release_id(target);
                } else {
                    warn!(uuid = %self.uuid, stream = %target, "Unexpected close acknowledgement");
                }
            }
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Fails the connection once, telling every stream.
    pub(crate) fn fail(&self, status: ConnectionStatus, reason: &str) {
        {
            let mut pending = self.pending.lock();
            if self.phase.load(Ordering::Acquire) == DISCONNECTED {
                return;
            }
            self.phase.store(DISCONNECTED, Ordering::Release);
            pending.clear();
        }

        warn!(uuid = %self.uuid, %status, reason, "Connection down");

        let entries = std::mem::take(&mut self.registry().entries);
        let callbacks: Vec<ConnectionCallback> = entries
            .values()
            .filter_map(|callbacks| callbacks.on_status.clone())
            .collect();
        drop(entries);
        for on_status in callbacks {
            on_status(status, reason);
        }

        for slot in self.sockets.read().iter() {
            slot.send.shutdown();
        }
        self.abort_tasks();
    }

    /// Closes the sockets after flushing, without callbacks.
    fn release(&self) {
        {
            let mut pending = self.pending.lock();
            if self.phase.load(Ordering::Acquire) == DISCONNECTED {
                return;
            }
            self.phase.store(DISCONNECTED, Ordering::Release);
            pending.clear();
        }

        debug!(uuid = %self.uuid, "Last stream released, closing sockets");
        for slot in self.sockets.read().iter() {
            if self.style == FramingStyle::ZeroDelimited {
                let mut data = Vec::with_capacity(2);
                encode_delimited_close(&mut data);
                let chunk = PendingChunk::new(StreamId::CONTROL, Reliability::ReliableOrdered, data);
                slot.send.enqueue(chunk, true);
            }
            slot.send.close_after_flush();
        }
        let entries = std::mem::take(&mut self.registry().entries);
        drop(entries);
        self.abort_tasks();
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn notify_status(&self, status: ConnectionStatus, reason: &str) {
        let callbacks: Vec<ConnectionCallback> = self
            .registry()
            .entries
            .values()
            .filter_map(|callbacks| callbacks.on_status.clone())
            .collect();
        for on_status in callbacks {
            on_status(status, reason);
        }
    }

    fn notify_ready(&self, streams: &[StreamId]) {
        let callbacks: Vec<ReadySendCallback> = {
            let registry = self.registry();
            let mut seen = FxHashSet::default();
            streams
                .iter()
                .filter(|stream_id| seen.insert(**stream_id))
                .filter_map(|stream_id| registry.entries.get(stream_id))
                .filter_map(|callbacks| callbacks.on_ready_send.clone())
                .collect()
        };
        for on_ready_send in callbacks {
            on_ready_send();
        }
    }

    // ========================================================================
    // Endpoints
    // ========================================================================

    /// Peer address of socket 0.
    #[must_use]
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.sockets.read().first().and_then(|slot| slot.peer_addr)
    }

    /// Local address of socket 0.
    #[must_use]
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.sockets.read().first().and_then(|slot| slot.local_addr)
    }

    /// Queue latency of the socket `stream_id` is routed to.
    #[must_use]
    pub fn average_send_latency(&self, stream_id: StreamId) -> Duration {
        let sockets = self.sockets.read();
        sockets
            .get(stream_slot(stream_id, sockets.len().max(1)))
            .map_or(Duration::ZERO, |slot| slot.send.average_latency())
    }

    /// Mean time received payloads waited for their callback, over all
    /// sockets that have delivered anything.
    #[must_use]
    pub fn average_receive_latency(&self) -> Duration {
        let sockets = self.sockets.read();
        let samples: Vec<Duration> = sockets
            .iter()
            .map(|slot| slot.read.average_latency())
            .filter(|latency| !latency.is_zero())
            .collect();
        match u32::try_from(samples.len()) {
            Ok(count) if count > 0 => samples.iter().sum::<Duration>() / count,
            _ => Duration::ZERO,
        }
    }
}

impl std::fmt::Debug for MultiplexedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedConnection")
            .field("uuid", &self.uuid)
            .field("role", &self.role)
            .field("style", &self.style)
            .field("phase", &self.phase.load(Ordering::Relaxed))
            .field("sockets", &self.sockets.read().len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Path Events
// ============================================================================

impl ChunkSink for MultiplexedConnection {
    fn deliver(&self, socket: usize, stream_id: StreamId, payload: &[u8]) -> ReceivedResponse {
        if stream_id.is_control() {
            self.handle_control(socket, payload);
            return ReceivedResponse::Accepted;
        }

        let mut registry = self.registry();
        if let Some(callbacks) = registry.entries.get(&stream_id) {
            let on_received = callbacks.on_received.clone();
            drop(registry);
            return on_received.map_or(ReceivedResponse::Accepted, |on_received| {
                on_received(payload)
            });
        }

        if registry.one_sided_closing.contains(&stream_id) {
            trace!(socket, stream = %stream_id, len = payload.len(), "Discarding data for closing stream");
            return ReceivedResponse::Accepted;
        }

        registry
            .entries
            .insert(stream_id, StreamCallbacks::default());
        drop(registry);

        debug!(uuid = %self.uuid, socket, stream = %stream_id, "Peer opened stream");
        self.accept_substream(stream_id, Some(payload))
    }

    fn pinged(&self, socket: usize, payload: Vec<u8>) {
        if self.style != FramingStyle::WebSocket {
            return;
        }

        let mut data = Vec::new();
        encode_websocket_frame(opcode::PONG, &payload, None, &mut data);
        let chunk = PendingChunk::new(StreamId::CONTROL, Reliability::ReliableOrdered, data);
        if let Some(slot) = self.sockets.read().get(socket) {
            slot.send.enqueue(chunk, true);
        }
    }

    fn socket_failed(&self, socket: usize, error: Error) {
        debug!(uuid = %self.uuid, socket, error = %error, "Socket read failed");
        self.fail(ConnectionStatus::Disconnected, &error.to_string());
    }
}

impl SendObserver for MultiplexedConnection {
    fn send_failed(&self, socket: usize, error: Error) {
        debug!(uuid = %self.uuid, socket, error = %error, "Socket write failed");
        self.fail(ConnectionStatus::Disconnected, &error.to_string());
    }

    fn send_drained(&self, _socket: usize, streams: Vec<StreamId>) {
        self.notify_ready(&streams);
    }
}

// ============================================================================
// Routing Helpers
// ============================================================================

/// Socket an ordered stream is pinned to.
fn stream_slot(stream_id: StreamId, sockets: usize) -> usize {
    let mut hasher = FxHasher::default();
    stream_id.hash(&mut hasher);
    (hasher.finish() % sockets as u64) as usize
}

/// Picks `favored` unless a random other socket has less queued.
fn least_busy(sockets: &[SocketSlot], favored: usize) -> usize {
    let other = rand::thread_rng().gen_range(0..sockets.len());
    if other == favored || sockets[favored].send.queued_bytes() < sockets[other].send.queued_bytes()
    {
        favored
    } else {
        other
    }
}

// ============================================================================
// Tests
// ============================================================================
