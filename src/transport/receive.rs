//! Per-socket receive path.
//!
//! A single task reads its socket into a fixed buffer, cuts complete frames
//! out of it and hands them to a [`ChunkSink`]. Frames whose total size
//! exceeds the low water mark are read straight into a buffer of their own
//! instead of being shuffled through the fixed one.
//!
//! # Backpressure
//!
//! When the sink answers [`ReceivedResponse::Paused`] the task marks its
//! [`ReadControl`] paused and stops reading until [`ReadControl::resume`] is
//! called, then offers the same payload again. No read is outstanding while
//! paused, and a resume that arrives while the path is not paused is
//! ignored.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::StreamId;
use crate::options::SstOptions;
use crate::protocol::frame::{Decoded, Frame, FrameDecoder, FrameHeader};
use crate::stream::ReceivedResponse;
use crate::transport::send::blend_latency;

// ============================================================================
// ChunkSink
// ============================================================================

/// Consumer of decoded frames.
pub trait ChunkSink: Send + Sync + 'static {
    /// Offers a payload for `stream_id`.
    fn deliver(&self, socket: usize, stream_id: StreamId, payload: &[u8]) -> ReceivedResponse;

    /// The peer pinged this socket.
    fn pinged(&self, socket: usize, payload: Vec<u8>);

    /// The socket failed or was closed; the path has stopped.
    fn socket_failed(&self, socket: usize, error: Error);
}

// ============================================================================
// ReadControl
// ============================================================================

/// Pause state and statistics a read loop shares with its connection.
#[derive(Debug, Default)]
pub struct ReadControl {
    resume: Notify,
    paused: AtomicBool,
    latency_nanos: AtomicU64,
}

impl ReadControl {
    /// Creates an unpaused control.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes the read loop if it is paused.
    ///
    /// Returns `true` if the loop was paused.
    pub fn resume(&self) -> bool {
        if self.paused.swap(false, Ordering::AcqRel) {
            self.resume.notify_one();
            true
        } else {
            false
        }
    }

    /// Returns `true` while the read loop waits for [`resume`](Self::resume).
    #[inline]
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Average time a payload waited between being decoded and accepted.
    #[inline]
    #[must_use]
    pub fn average_latency(&self) -> Duration {
        Duration::from_nanos(self.latency_nanos.load(Ordering::Relaxed))
    }

    async fn wait_resume(&self) {
        // The flag goes up before waiting; a resume in between leaves a
        // permit the wait consumes.
        self.paused.store(true, Ordering::Release);
        self.resume.notified().await;
    }

    fn record_latency(&self, since: Instant) {
        let previous = self.latency_nanos.load(Ordering::Relaxed);
        self.latency_nanos
            .store(blend_latency(previous, since.elapsed()), Ordering::Relaxed);
    }
}

// ============================================================================
// ReceivePath
// ============================================================================

/// Read loop state of one socket.
pub struct ReceivePath<R> {
    socket: usize,
    reader: R,
    decoder: FrameDecoder,
    buffer: Vec<u8>,
    filled: usize,
    low_water_mark: usize,
    max_buffer: usize,
    control: Arc<ReadControl>,
}

impl<R> ReceivePath<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    /// Creates a path reading `reader` with the buffer sizes from `options`.
    #[must_use]
    pub fn new(
        socket: usize,
        reader: R,
        decoder: FrameDecoder,
        options: &SstOptions,
        control: Arc<ReadControl>,
    ) -> Self {
        Self {
            socket,
            reader,
            decoder,
            buffer: vec![0u8; options.receive_buffer_size],
            filled: 0,
            low_water_mark: options.low_water_mark,
            max_buffer: options.max_frame_buffer.max(options.receive_buffer_size),
            control,
        }
    }

    /// Seeds the buffer with bytes read during the handshake.
    #[must_use]
    pub fn with_initial(mut self, bytes: &[u8]) -> Self {
        if bytes.len() > self.buffer.len() {
            self.buffer.resize(bytes.len(), 0);
        }
        self.buffer[..bytes.len()].copy_from_slice(bytes);
        self.filled = bytes.len();
        self
    }

    /// Runs until the socket fails, reporting the failure to `sink`.
    pub async fn run<S: ChunkSink>(mut self, sink: Arc<S>) {
        if let Err(error) = self.read_loop(sink.as_ref()).await {
            debug!(socket = self.socket, error = %error, "Receive path stopped");
            sink.socket_failed(self.socket, error);
        }
    }

    async fn read_loop<S: ChunkSink>(&mut self, sink: &S) -> Result<()> {
        if self.filled > 0 {
            self.process(sink).await?;
        }

        loop {
            if self.filled == self.buffer.len() {
                if self.buffer.len() >= self.max_buffer {
                    return Err(Error::protocol(format!(
                        "Buffered frame exceeds {} bytes without completing",
                        self.max_buffer
                    )));
                }
                let grown = (self.buffer.len() * 2).min(self.max_buffer);
                trace!(socket = self.socket, size = grown, "Growing receive buffer");
                self.buffer.resize(grown, 0);
            }

            let read = self.reader.read(&mut self.buffer[self.filled..]).await?;
            if read == 0 {
                return Err(Error::disconnected("Remote host closed the socket"));
            }
            self.filled += read;

            self.process(sink).await?;
        }
    }

    /// Delivers every complete frame in the buffer, then compacts it.
    async fn process<S: ChunkSink>(&mut self, sink: &S) -> Result<()> {
        let mut pos = 0;

        while pos < self.filled {
            match self.decoder.decode(&self.buffer[pos..self.filled]) {
                Ok(Decoded::NeedMore) => break,
                Ok(Decoded::Frame { frame, consumed }) => {
                    pos += consumed;
                    self.dispatch(frame, sink).await?;
                }
                Ok(Decoded::Corrupt { error, consumed }) => {
                    warn!(socket = self.socket, error = %error, "Dropping corrupt frame");
                    pos += consumed;
                }
                Ok(Decoded::Partial(header)) => {
                    if header.total_len() <= self.low_water_mark {
                        break;
                    }
                    let frame = self.read_large(pos, header).await?;
                    pos = 0;
                    if let Some(frame) = frame {
                        self.dispatch(frame, sink).await?;
                    }
                }
                Err(error) => {
                    warn!(
                        socket = self.socket,
                        error = %error,
                        dropped = self.filled - pos,
                        "Unparsable frame header, discarding buffered bytes"
                    );
                    pos = self.filled;
                }
            }
        }

        self.buffer.copy_within(pos..self.filled, 0);
        self.filled -= pos;
        Ok(())
    }

    /// Reads the rest of a large frame into its own buffer.
    ///
    /// Empties the fixed buffer. Returns `None` if the body is corrupt.
    async fn read_large(&mut self, start: usize, header: FrameHeader) -> Result<Option<Frame>> {
        trace!(
            socket = self.socket,
            len = header.body_len,
            "Reading large frame directly"
        );

        let mut body = vec![0u8; header.body_len];
        let mut mask = header.mask;

        let body_start = start + header.header_len;
        let available = self.filled - body_start;
        body[..available].copy_from_slice(&self.buffer[body_start..self.filled]);
        if let Some(mask) = mask.as_mut() {
            mask.apply(&mut body[..available]);
        }
        self.filled = 0;

        let mut offset = available;
        while offset < body.len() {
            let read = self.reader.read(&mut body[offset..]).await?;
            if read == 0 {
                return Err(Error::disconnected("Remote host closed the socket mid-frame"));
            }
            if let Some(mask) = mask.as_mut() {
                mask.apply(&mut body[offset..offset + read]);
            }
            offset += read;
        }

        match self.decoder.finish(header.kind, body) {
            Ok(frame) => Ok(Some(frame)),
            Err(error) => {
                warn!(socket = self.socket, error = %error, "Dropping corrupt large frame");
                Ok(None)
            }
        }
    }

    async fn dispatch<S: ChunkSink>(&mut self, frame: Frame, sink: &S) -> Result<()> {
        match frame {
            Frame::Data { stream_id, payload } => {
                let decoded_at = Instant::now();
                while sink.deliver(self.socket, stream_id, &payload) == ReceivedResponse::Paused {
                    debug!(socket = self.socket, stream = %stream_id, "Receive paused");
                    self.control.wait_resume().await;
                    trace!(socket = self.socket, stream = %stream_id, "Receive resumed");
                }
                self.control.record_latency(decoded_at);
            }
            Frame::Ping(payload) => sink.pinged(self.socket, payload),
            Frame::Pong | Frame::Skipped => {}
            Frame::Close => return Err(Error::disconnected("Peer sent a close frame")),
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadBuf};

    use crate::protocol::frame::{FramingStyle, encode_frame, encode_websocket_frame, opcode};

    #[derive(Default)]
    struct TestSink {
        delivered: Mutex<Vec<(StreamId, Vec<u8>)>>,
        pause_next: AtomicBool,
        pings: Mutex<Vec<Vec<u8>>>,
        failures: Mutex<Vec<String>>,
    }

    impl ChunkSink for TestSink {
        fn deliver(&self, _socket: usize, stream_id: StreamId, payload: &[u8]) -> ReceivedResponse {
            self.delivered.lock().push((stream_id, payload.to_vec()));
            if self.pause_next.swap(false, Ordering::SeqCst) {
                ReceivedResponse::Paused
            } else {
                ReceivedResponse::Accepted
            }
        }

        fn pinged(&self, _socket: usize, payload: Vec<u8>) {
            self.pings.lock().push(payload);
        }

        fn socket_failed(&self, _socket: usize, error: Error) {
            self.failures.lock().push(error.to_string());
        }
    }

    struct CountingReader {
        inner: DuplexStream,
        polls: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    fn native(stream: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_frame(FramingStyle::Native, StreamId::new(stream), payload, &mut out)
            .expect("encode");
        out
    }

    fn options(buffer: usize) -> SstOptions {
        SstOptions::new().with_receive_buffer_size(buffer)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn paused_path(
        sink: &Arc<TestSink>,
        control: &Arc<ReadControl>,
    ) -> (ReceivePath<CountingReader>, DuplexStream, Arc<AtomicUsize>) {
        let (reader, writer) = tokio::io::duplex(4096);
        let polls = Arc::new(AtomicUsize::new(0));
        let counting = CountingReader {
            inner: reader,
            polls: Arc::clone(&polls),
        };
        sink.pause_next.store(true, Ordering::SeqCst);
        let path = ReceivePath::new(
            0,
            counting,
            FrameDecoder::new(FramingStyle::Native),
            &options(1024),
            Arc::clone(control),
        );
        (path, writer, polls)
    }

    #[test]
    fn test_run_future_is_send_with_boxed_reader() {
        fn assert_send<T: Send>(_: &T) {}

        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(tokio::io::empty());
        let path = ReceivePath::new(
            0,
            reader,
            FrameDecoder::new(FramingStyle::Native),
            &options(1024),
            Arc::new(ReadControl::new()),
        );
        let running = path.run(Arc::new(TestSink::default()));
        assert_send(&running);
    }

    #[tokio::test]
    async fn test_pause_stops_reads_until_resume() {
        let sink = Arc::new(TestSink::default());
        let control = Arc::new(ReadControl::new());
        let (path, mut writer, polls) = paused_path(&sink, &control);
        let mut wire = native(1, b"first");
        wire.extend(native(1, b"second"));
        writer.write_all(&wire).await.expect("write");

        let task = tokio::spawn(path.run(Arc::clone(&sink)));

        wait_for(|| control.is_paused()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.delivered.lock().len(), 1);

        assert!(control.resume());
        wait_for(|| sink.delivered.lock().len() == 3).await;
        wait_for(|| polls.load(Ordering::SeqCst) >= 2).await;
        assert!(!control.is_paused());

        let delivered = sink.delivered.lock().clone();
        assert_eq!(delivered[0].1, b"first");
        assert_eq!(delivered[1].1, b"first");
        assert_eq!(delivered[2].1, b"second");

        task.abort();
    }

    #[tokio::test]
    async fn test_resume_before_pause_is_ignored() {
        let sink = Arc::new(TestSink::default());
        let control = Arc::new(ReadControl::new());
        let (path, mut writer, polls) = paused_path(&sink, &control);

        assert!(!control.resume());
        assert!(!control.resume());

        let mut wire = native(1, b"first");
        wire.extend(native(1, b"second"));
        writer.write_all(&wire).await.expect("write");
        let task = tokio::spawn(path.run(Arc::clone(&sink)));

        wait_for(|| !sink.delivered.lock().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.delivered.lock().len(), 1);
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert!(control.is_paused());

        assert!(control.resume());
        wait_for(|| sink.delivered.lock().len() == 3).await;

        task.abort();
    }

    #[tokio::test]
    async fn test_receive_latency_includes_pause() {
        let sink = Arc::new(TestSink::default());
        let control = Arc::new(ReadControl::new());
        let (path, mut writer, _polls) = paused_path(&sink, &control);
        writer.write_all(&native(1, b"held")).await.expect("write");

        let task = tokio::spawn(path.run(Arc::clone(&sink)));
        wait_for(|| control.is_paused()).await;
        assert_eq!(control.average_latency(), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(50)).await;
        control.resume();
        wait_for(|| sink.delivered.lock().len() == 2).await;
        wait_for(|| control.average_latency() > Duration::ZERO).await;
        assert!(control.average_latency() >= Duration::from_millis(50));

        task.abort();
    }

    #[tokio::test]
    async fn test_large_frame_over_partial_reads() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let wire = native(7, &payload);
        let tail = native(9, b"after");

        let mock = tokio_test::io::Builder::new()
            .read(&wire[..100])
            .read(&wire[100..70_000])
            .read(&wire[70_000..])
            .read(&tail)
            .build();

        let sink = Arc::new(TestSink::default());
        let path = ReceivePath::new(
            0,
            mock,
            FrameDecoder::new(FramingStyle::Native),
            &options(1024),
            Arc::new(ReadControl::new()),
        );
        path.run(Arc::clone(&sink)).await;

        let delivered = sink.delivered.lock().clone();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].0, StreamId::new(7));
        assert_eq!(delivered[0].1, payload);
        assert_eq!(delivered[1], (StreamId::new(9), b"after".to_vec()));
        assert_eq!(sink.failures.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_masked_large_websocket_frame() {
        let mut body = vec![3u8];
        body.extend((0..5_000u32).map(|i| (i * 7) as u8));
        let mut wire = Vec::new();
        encode_websocket_frame(opcode::BINARY, &body, Some([0x12, 0x34, 0x56, 0x78]), &mut wire);

        let mock = tokio_test::io::Builder::new()
            .read(&wire[..11])
            .read(&wire[11..2_003])
            .read(&wire[2_003..])
            .build();

        let sink = Arc::new(TestSink::default());
        let path = ReceivePath::new(
            1,
            mock,
            FrameDecoder::new(FramingStyle::WebSocket),
            &options(256),
            Arc::new(ReadControl::new()),
        );
        path.run(Arc::clone(&sink)).await;

        let delivered = sink.delivered.lock().clone();
        assert_eq!(delivered, vec![(StreamId::new(3), body[1..].to_vec())]);
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let mut wire = native(1, b"alpha");
        wire.extend(native(3, b"beta"));
        wire.extend(native(5, b"gamma"));

        let mut builder = tokio_test::io::Builder::new();
        for byte in &wire {
            builder.read(std::slice::from_ref(byte));
        }
        let mock = builder.build();

        let sink = Arc::new(TestSink::default());
        let path = ReceivePath::new(
            0,
            mock,
            FrameDecoder::new(FramingStyle::Native),
            &options(1024),
            Arc::new(ReadControl::new()),
        );
        path.run(Arc::clone(&sink)).await;

        let ids: Vec<u32> = sink.delivered.lock().iter().map(|(id, _)| id.as_u32()).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn test_corrupt_frame_dropped_and_stream_continues() {
        let mut wire = vec![0x00];
        wire.extend(native(1, b"ok"));

        let mock = tokio_test::io::Builder::new().read(&wire).build();
        let sink = Arc::new(TestSink::default());
        let path = ReceivePath::new(
            0,
            mock,
            FrameDecoder::new(FramingStyle::Native),
            &options(1024),
            Arc::new(ReadControl::new()),
        );
        path.run(Arc::clone(&sink)).await;

        assert_eq!(*sink.delivered.lock(), vec![(StreamId::INITIAL, b"ok".to_vec())]);
    }

    #[tokio::test]
    async fn test_ping_and_close_frames() {
        let mut wire = Vec::new();
        encode_websocket_frame(opcode::PING, b"are you there", Some([1, 2, 3, 4]), &mut wire);
        encode_websocket_frame(opcode::CLOSE, b"", Some([1, 2, 3, 4]), &mut wire);

        let mock = tokio_test::io::Builder::new().read(&wire).build();
        let sink = Arc::new(TestSink::default());
        let path = ReceivePath::new(
            0,
            mock,
            FrameDecoder::new(FramingStyle::WebSocket),
            &options(1024),
            Arc::new(ReadControl::new()),
        );
        path.run(Arc::clone(&sink)).await;

        assert_eq!(*sink.pings.lock(), vec![b"are you there".to_vec()]);
        let failures = sink.failures.lock().clone();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("close frame"));
    }

    #[tokio::test]
    async fn test_initial_bytes_processed_first() {
        let leftover = native(1, b"early");
        let mock = tokio_test::io::Builder::new().read(&native(1, b"late")).build();

        let sink = Arc::new(TestSink::default());
        let path = ReceivePath::new(
            0,
            mock,
            FrameDecoder::new(FramingStyle::Native),
            &options(1024),
            Arc::new(ReadControl::new()),
        )
        .with_initial(&leftover);
        path.run(Arc::clone(&sink)).await;

        let payloads: Vec<Vec<u8>> = sink.delivered.lock().iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(payloads, vec![b"early".to_vec(), b"late".to_vec()]);
    }

    #[tokio::test]
    async fn test_zero_delimited_grows_buffer() {
        let payload = vec![0x5Au8; 3_000];
        let mut wire = Vec::new();
        encode_frame(FramingStyle::ZeroDelimited, StreamId::new(2), &payload, &mut wire)
            .expect("encode");

        let mock = tokio_test::io::Builder::new().read(&wire).build();
        let sink = Arc::new(TestSink::default());
        let path = ReceivePath::new(
            0,
            mock,
            FrameDecoder::new(FramingStyle::ZeroDelimited),
            &options(256),
            Arc::new(ReadControl::new()),
        );
        path.run(Arc::clone(&sink)).await;

        assert_eq!(*sink.delivered.lock(), vec![(StreamId::new(2), payload)]);
    }

    #[tokio::test]
    async fn test_unterminated_delimited_frame_hits_buffer_cap() {
        let mut wire = vec![0x00u8];
        wire.extend(std::iter::repeat_n(b'A', 4_000));

        let mock = tokio_test::io::Builder::new().read(&wire).build();
        let sink = Arc::new(TestSink::default());
        let path = ReceivePath::new(
            0,
            mock,
            FrameDecoder::new(FramingStyle::ZeroDelimited),
            &options(256).with_max_frame_buffer(1024),
            Arc::new(ReadControl::new()),
        );
        path.run(Arc::clone(&sink)).await;

        assert!(sink.delivered.lock().is_empty());
        let failures = sink.failures.lock().clone();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("1024 bytes"), "{}", failures[0]);
    }
}
