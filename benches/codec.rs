//! Codec and loopback benchmark suite.
//!
//! Benchmarks the frame codecs at different payload sizes and the
//! end-to-end throughput of a loopback connection:
//! - Payload sizes: 64 B, 1 KiB, 64 KiB
//! - Socket counts: 1, 4
//!
//! Run with: cargo bench --bench codec
//! Results saved to: target/criterion/

use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tcpsst::protocol::frame::{encode_websocket_frame, opcode};
use tcpsst::protocol::varint::{decode_varint, encode_varint};
use tcpsst::protocol::{Decoded, FrameDecoder, FramingStyle, encode_frame};
use tcpsst::{
    LogicalStream, ReceivedResponse, Reliability, SstListener, SstOptions, StreamCallbacks,
    StreamId, SubstreamCallback,
};
use tokio::runtime::Runtime;
use tokio::sync::Notify;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const PAYLOAD_SIZES: &[usize] = &[64, 1024, 64 * 1024];
const SOCKET_COUNTS: &[usize] = &[1, 4];
const STYLES: &[FramingStyle] = &[
    FramingStyle::Native,
    FramingStyle::WebSocket,
    FramingStyle::ZeroDelimited,
];

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ============================================================================
// Benchmark: Varint
// ============================================================================

fn bench_varint(c: &mut Criterion) {
    let mut group = c.benchmark_group("varint");
    let values: Vec<u32> = (0..30).map(|shift| 1u32 << shift).collect();

    group.bench_function("encode", |b| {
        let mut out = Vec::with_capacity(values.len() * 5);
        b.iter(|| {
            out.clear();
            for &value in &values {
                encode_varint(black_box(value), &mut out).unwrap();
            }
        });
    });

    let mut encoded = Vec::new();
    for &value in &values {
        encode_varint(value, &mut encoded).unwrap();
    }
    group.bench_function("decode", |b| {
        b.iter(|| {
            let mut rest = black_box(&encoded[..]);
            while let Some((value, used)) = decode_varint(rest).unwrap() {
                black_box(value);
                rest = &rest[used..];
            }
        });
    });

    group.finish();
}

// ============================================================================
// Benchmark: Frame Encode / Decode
// ============================================================================

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames");

    for &style in STYLES {
        for &size in PAYLOAD_SIZES {
            let data = payload(size);
            let id = format!("{style:?}/{size}");
            group.throughput(Throughput::Bytes(size as u64));

            group.bench_with_input(BenchmarkId::new("encode", &id), &data, |b, data| {
                let mut out = Vec::with_capacity(size * 2);
                b.iter(|| {
                    out.clear();
                    encode_frame(style, StreamId::new(7), black_box(data), &mut out).unwrap();
                });
            });

            let mut wire = Vec::new();
            encode_frame(style, StreamId::new(7), &data, &mut wire).unwrap();
            group.bench_with_input(BenchmarkId::new("decode", &id), &wire, |b, wire| {
                let mut decoder = FrameDecoder::new(style);
                b.iter(|| match decoder.decode(black_box(wire)).unwrap() {
                    Decoded::Frame { frame, .. } => black_box(frame),
                    other => panic!("unexpected {other:?}"),
                });
            });
        }
    }

    group.finish();
}

fn bench_masked_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("masked_decode");

    for &size in PAYLOAD_SIZES {
        let mut body = vec![0x07];
        body.extend_from_slice(&payload(size));
        let mut wire = Vec::new();
        encode_websocket_frame(opcode::BINARY, &body, Some([0x37, 0xFA, 0x21, 0x3D]), &mut wire);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            let mut decoder = FrameDecoder::new(FramingStyle::WebSocket);
            b.iter(|| black_box(decoder.decode(black_box(wire)).unwrap()));
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Loopback Throughput
// ============================================================================

struct Loopback {
    client: LogicalStream,
    received: Arc<AtomicUsize>,
    arrived: Arc<Notify>,
    // Dropping the accepted stream would close the connection.
    _accepted: Arc<parking_lot::Mutex<Vec<LogicalStream>>>,
    _listener: Arc<SstListener>,
}

async fn loopback(sockets: usize) -> Loopback {
    let received = Arc::new(AtomicUsize::new(0));
    let arrived = Arc::new(Notify::new());
    let accepted = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let counter = Arc::clone(&received);
    let wake = Arc::clone(&arrived);
    let keep = Arc::clone(&accepted);
    let on_stream: SubstreamCallback = Arc::new(move |stream: LogicalStream| {
        keep.lock().push(stream);
        let counter = Arc::clone(&counter);
        let wake = Arc::clone(&wake);
        Some(StreamCallbacks::new().on_received(move |_| {
            counter.fetch_add(1, Ordering::AcqRel);
            wake.notify_one();
            ReceivedResponse::Accepted
        }))
    });

    let listener = SstListener::bind("127.0.0.1:0", SstOptions::new(), on_stream)
        .await
        .unwrap();
    let client = tcpsst::connect(
        &listener.local_addr().to_string(),
        SstOptions::new().with_parallel_sockets(sockets),
        None,
        StreamCallbacks::new(),
    )
    .unwrap();

    Loopback {
        client,
        received,
        arrived,
        _accepted: accepted,
        _listener: listener,
    }
}

fn bench_loopback(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("loopback");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(10));

    for &sockets in SOCKET_COUNTS {
        let link = Arc::new(rt.block_on(loopback(sockets)));

        for &size in PAYLOAD_SIZES {
            let data = Arc::new(payload(size));
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{sockets}_sockets"), size),
                &size,
                |b, _| {
                    b.to_async(&rt).iter_custom(|iters| {
                        let link = Arc::clone(&link);
                        let data = Arc::clone(&data);
                        async move {
                            let target = link.received.load(Ordering::Acquire) + iters as usize;
                            let start = Instant::now();
                            for _ in 0..iters {
                                link.client.send(&data, Reliability::ReliableUnordered);
                            }
                            while link.received.load(Ordering::Acquire) < target {
                                link.arrived.notified().await;
                            }
                            start.elapsed()
                        }
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_varint,
    bench_frames,
    bench_masked_decode,
    bench_loopback
);
criterion_main!(benches);
