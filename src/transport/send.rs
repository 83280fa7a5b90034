//! Per-socket send path.
//!
//! Any thread may enqueue a chunk; exactly one task at a time owns the
//! socket's writer. Small chunks queued behind an in-flight write are
//! coalesced into one buffer; a chunk at least as large as the buffer is
//! written on its own.
//!
//! # States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Idle` | No writer task; the writer half is parked in the path |
//! | `Sending` | One task holds the writer and drains the queue |
//! | `Closed` | Writer shut down or failed; chunks are refused |
//!
//! Enqueuers push onto a lock-free queue and then try to move
//! `Idle -> Sending`. The winner spawns the drain task. The drain task
//! parks the writer before returning to `Idle` and re-checks the queue
//! afterwards, so a chunk pushed during that window is never stranded.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::identifiers::StreamId;
use crate::stream::Reliability;

// ============================================================================
// Constants
// ============================================================================

const IDLE: u8 = 0;
const SENDING: u8 = 1;
const CLOSED: u8 = 2;

/// Weight of a new sample in the latency averages, in tenths.
const LATENCY_SAMPLE_WEIGHT: u64 = 1;

/// Folds `sample` into the moving average `previous`, both in nanoseconds.
pub(crate) fn blend_latency(previous: u64, sample: Duration) -> u64 {
    let sample = sample.as_nanos().min(u128::from(u64::MAX)) as u64;
    if previous == 0 {
        sample
    } else {
        (previous / 10) * (10 - LATENCY_SAMPLE_WEIGHT) + (sample / 10) * LATENCY_SAMPLE_WEIGHT
    }
}

// ============================================================================
// Types
// ============================================================================

/// A framed chunk waiting for its socket.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    /// Stream the chunk belongs to.
    pub stream_id: StreamId,
    /// Delivery class.
    pub reliability: Reliability,
    /// Encoded frame bytes.
    pub data: Vec<u8>,
    /// When the chunk was handed to the transport.
    pub queued_at: Instant,
}

impl PendingChunk {
    /// Creates a chunk stamped with the current time.
    #[inline]
    #[must_use]
    pub fn new(stream_id: StreamId, reliability: Reliability, data: Vec<u8>) -> Self {
        Self {
            stream_id,
            reliability,
            data,
            queued_at: Instant::now(),
        }
    }
}

/// Receives send path events.
pub trait SendObserver: Send + Sync + 'static {
    /// A write failed; the path is closed.
    fn send_failed(&self, socket: usize, error: Error);

    /// The queue drained; `streams` asked to be told.
    fn send_drained(&self, socket: usize, streams: Vec<StreamId>);
}

// ============================================================================
// SendPath
// ============================================================================

/// Single-writer, coalescing send queue of one socket.
pub struct SendPath<W> {
    socket: usize,
    state: AtomicU8,
    queue: SegQueue<PendingChunk>,
    writer: Mutex<Option<W>>,
    queued_bytes: AtomicUsize,
    buffer_size: usize,
    max_queued_bytes: usize,
    closing: AtomicBool,
    latency_nanos: AtomicU64,
    ready_waiters: Mutex<Vec<StreamId>>,
    runtime: Handle,
    observer: Weak<dyn SendObserver>,
}

impl<W> SendPath<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// Creates an idle path owning `writer`.
    ///
    /// # Arguments
    ///
    /// * `socket` - Slot index, used in logs and events
    /// * `buffer_size` - Coalescing buffer size
    /// * `max_queued_bytes` - Soft queue bound, 0 for none
    #[must_use]
    pub fn new(
        socket: usize,
        writer: W,
        buffer_size: usize,
        max_queued_bytes: usize,
        runtime: Handle,
        observer: Weak<dyn SendObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket,
            state: AtomicU8::new(IDLE),
            queue: SegQueue::new(),
            writer: Mutex::new(Some(writer)),
            queued_bytes: AtomicUsize::new(0),
            buffer_size: buffer_size.max(1),
            max_queued_bytes,
            closing: AtomicBool::new(false),
            latency_nanos: AtomicU64::new(0),
            ready_waiters: Mutex::new(Vec::new()),
            runtime,
            observer,
        })
    }

    /// Queues a chunk for writing.
    ///
    /// Returns `false` if the path is closed, or if `force` is unset and the
    /// chunk would push a non-empty queue past the configured bound. In the
    /// latter case the stream is told once the queue drains.
    pub fn enqueue(self: &Arc<Self>, chunk: PendingChunk, force: bool) -> bool {
        if self.state.load(Ordering::Acquire) == CLOSED || self.closing.load(Ordering::Acquire) {
            return false;
        }

        let len = chunk.data.len();
        if !force && !self.has_room(len) {
            trace!(socket = self.socket, stream = %chunk.stream_id, len, "Send queue full");
            self.ready_waiters.lock().push(chunk.stream_id);
            return false;
        }

        self.queued_bytes.fetch_add(len, Ordering::AcqRel);
        self.queue.push(chunk);
        self.kick();
        true
    }

    /// Returns `true` if a chunk of `len` bytes would be accepted now.
    #[inline]
    #[must_use]
    pub fn can_send(&self, len: usize) -> bool {
        self.state.load(Ordering::Acquire) != CLOSED && self.has_room(len)
    }

    /// Bytes queued but not yet written.
    #[inline]
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }

    /// Exponentially weighted time chunks spend queued.
    #[inline]
    #[must_use]
    pub fn average_latency(&self) -> Duration {
        Duration::from_nanos(self.latency_nanos.load(Ordering::Relaxed))
    }

    /// Returns `true` once the path refuses chunks.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// Asks for a drain notification for `stream_id`.
    ///
    /// Fires promptly if the queue is already empty.
    pub fn request_ready_send(self: &Arc<Self>, stream_id: StreamId) {
        self.ready_waiters.lock().push(stream_id);
        self.kick();
    }

    /// Writes out everything queued, then shuts the writer down.
    pub fn close_after_flush(self: &Arc<Self>) {
        self.closing.store(true, Ordering::Release);
        self.kick();
    }

    /// Closes immediately, discarding queued chunks.
    pub fn shutdown(&self) {
        if self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED {
            debug!(socket = self.socket, "Send path shut down");
        }
        drop(self.writer.lock().take());
        while self.queue.pop().is_some() {}
        self.queued_bytes.store(0, Ordering::Release);
    }

    fn has_room(&self, len: usize) -> bool {
        if self.max_queued_bytes == 0 {
            return true;
        }
        let queued = self.queued_bytes();
        queued == 0 || queued + len <= self.max_queued_bytes
    }

    /// Starts a drain task unless one is already running.
    fn kick(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(IDLE, SENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let path = Arc::clone(self);
            self.runtime.spawn(path.drain());
        }
    }

    async fn drain(self: Arc<Self>) {
        let Some(mut writer) = self.writer.lock().take() else {
            self.state.store(CLOSED, Ordering::Release);
            return;
        };

        let mut batch = Vec::with_capacity(self.buffer_size);
        let mut carry: Option<PendingChunk> = None;

        loop {
            if self.state.load(Ordering::Acquire) == CLOSED {
                return;
            }

            let Some(first) = carry.take().or_else(|| self.queue.pop()) else {
                if self.closing.load(Ordering::Acquire) {
                    if let Err(e) = writer.shutdown().await {
                        trace!(socket = self.socket, error = %e, "Writer shutdown failed");
                    }
                    self.state.store(CLOSED, Ordering::Release);
                    debug!(socket = self.socket, "Send path flushed and closed");
                    return;
                }

                *self.writer.lock() = Some(writer);
                if self
                    .state
                    .compare_exchange(SENDING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    drop(self.writer.lock().take());
                    return;
                }
                self.notify_drained();

                if self.queue.is_empty() && !self.closing.load(Ordering::Acquire) {
                    return;
                }
                if self
                    .state
                    .compare_exchange(IDLE, SENDING, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return;
                }
                match self.writer.lock().take() {
                    Some(parked) => writer = parked,
                    None => return,
                }
                continue;
            };

            let result = if first.data.len() >= self.buffer_size {
                self.record_latency(&first);
                let len = first.data.len();
                writer.write_all(&first.data).await.map(|()| len)
            } else {
                batch.clear();
                self.record_latency(&first);
                batch.extend_from_slice(&first.data);

                while let Some(chunk) = self.queue.pop() {
                    if batch.len() + chunk.data.len() > self.buffer_size {
                        carry = Some(chunk);
                        break;
                    }
                    self.record_latency(&chunk);
                    batch.extend_from_slice(&chunk.data);
                }
                writer.write_all(&batch).await.map(|()| batch.len())
            };

            match result {
                Ok(written) => {
                    // shutdown() may have zeroed the count mid-write.
                    let _ = self.queued_bytes.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        |queued| Some(queued.saturating_sub(written)),
                    );
                }
                Err(e) => {
                    warn!(socket = self.socket, error = %e, "Socket write failed");
                    self.shutdown();
                    if let Some(observer) = self.observer.upgrade() {
                        observer.send_failed(self.socket, e.into());
                    }
                    return;
                }
            }
        }
    }

    fn record_latency(&self, chunk: &PendingChunk) {
        let previous = self.latency_nanos.load(Ordering::Relaxed);
        self.latency_nanos.store(
            blend_latency(previous, chunk.queued_at.elapsed()),
            Ordering::Relaxed,
        );
    }

    fn notify_drained(&self) {
        let streams = std::mem::take(&mut *self.ready_waiters.lock());
        if streams.is_empty() {
            return;
        }
        if let Some(observer) = self.observer.upgrade() {
            observer.send_drained(self.socket, streams);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
