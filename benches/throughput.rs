//! Throughput Benchmark for cmdlink
//!
//! Measures the command codec and the streaming frame parser.

use cmdlink::protocol::{Command, FrameParser, MAX_PAYLOAD_LEN};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

/// Benchmark frame encoding
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));

    let small = Command::from_integer(0x10, 42);
    group.bench_function("encode_integer", |b| {
        b.iter(|| black_box(small.encode()));
    });

    let large = Command::new(0x11, vec![0xAB; MAX_PAYLOAD_LEN]).unwrap();
    group.bench_function("encode_max_payload", |b| {
        b.iter(|| black_box(large.encode()));
    });

    group.finish();
}

/// Benchmark whole-frame decoding
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    let frame = Command::from_string(0x3F, "Hello, server!!!").unwrap().encode();
    group.bench_function("decode_string", |b| {
        b.iter(|| black_box(Command::decode(&frame).unwrap()));
    });

    group.finish();
}

/// Benchmark the streaming parser on a stream of back-to-back frames
fn bench_parser(c: &mut Criterion) {
    let mut stream = Vec::new();
    for i in 0..1_000u32 {
        stream.extend_from_slice(&Command::from_integer(0x71, i).encode());
    }

    let mut group = c.benchmark_group("parser");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    group.bench_function("feed_whole_stream", |b| {
        let mut parser = FrameParser::default();
        b.iter(|| black_box(parser.feed(&stream)));
    });

    group.bench_function("feed_small_chunks", |b| {
        let mut parser = FrameParser::default();
        b.iter(|| {
            for chunk in stream.chunks(7) {
                black_box(parser.feed(chunk));
            }
        });
    });

    // Garbage between frames forces resyncs and malformed-frame reports
    let mut noisy = Vec::new();
    for i in 0..1_000u32 {
        noisy.extend_from_slice(&[0x00, 0x0D, 0x0A, 0x55]);
        noisy.extend_from_slice(&Command::from_integer(0x71, i).encode());
    }
    group.bench_function("feed_noisy_stream", |b| {
        let mut parser = FrameParser::default();
        b.iter(|| black_box(parser.feed(&noisy)));
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_parser);

criterion_main!(benches);
