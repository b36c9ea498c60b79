//! Body streaming benchmarks
//!
//! Measures the pieces every response body passes through:
//! - chunked transfer decoding
//! - HTTP/2 DATA frame encoding and splitting
//! - demand-driven delivery from a publisher to a blocking reader
//! - line splitting on top of a byte body
//!
//! Run with: cargo bench --bench body_flow

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vclient::http::chunked::{chunk_header, decode_chunked_body, ChunkedDecoder, Decoded};
use vclient::http::flow::{body, lines, BodyReader, Charset, Publisher, Pull};
use vclient::http::h2::codec::FrameCodec;
use vclient::http::h2::frames::DataFrame;

const SIZES: [usize; 3] = [1024, 64 * 1024, 1024 * 1024];

fn chunked_wire(total: usize, chunk: usize) -> Vec<u8> {
    let mut wire = Vec::with_capacity(total + total / chunk * 8 + 8);
    let payload = vec![b'x'; chunk];
    let mut left = total;
    while left > 0 {
        let n = left.min(chunk);
        wire.extend_from_slice(chunk_header(n).as_bytes());
        wire.extend_from_slice(&payload[..n]);
        wire.extend_from_slice(b"\r\n");
        left -= n;
    }
    wire.extend_from_slice(b"0\r\n\r\n");
    wire
}

fn bench_chunked_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked_decode");

    for size in SIZES {
        let wire = chunked_wire(size, 4096);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("whole", size), &wire, |b, wire| {
            b.iter(|| black_box(decode_chunked_body(black_box(wire)).unwrap()));
        });

        // Same body arriving in 1500 byte reads
        group.bench_with_input(BenchmarkId::new("segmented", size), &wire, |b, wire| {
            b.iter(|| {
                let mut decoder = ChunkedDecoder::new();
                let mut buf = BytesMut::new();
                let mut seen = 0usize;
                for segment in wire.chunks(1500) {
                    buf.extend_from_slice(segment);
                    loop {
                        match decoder.decode(&mut buf).unwrap() {
                            Decoded::Data(data) => seen += data.len(),
                            Decoded::NeedMore | Decoded::Done => break,
                        }
                    }
                }
                assert!(decoder.is_complete());
                black_box(seen)
            });
        });
    }

    group.finish();
}

fn bench_data_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("h2_data_frames");

    for size in SIZES {
        let data = Bytes::from(vec![0u8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode_split", size), &data, |b, data| {
            b.iter(|| {
                let mut codec = FrameCodec::new();
                let mut offset = 0;
                while offset < data.len() {
                    let end = (offset + 16_384).min(data.len());
                    let frame = DataFrame::new(1, data.slice(offset..end), end == data.len());
                    codec.feed(&FrameCodec::encode_data_frame(&frame));
                    offset = end;
                }
                let mut frames = 0;
                while let Some(frame) = codec.next_frame(16_384).unwrap() {
                    black_box(frame);
                    frames += 1;
                }
                frames
            });
        });
    }

    group.finish();
}

fn bench_body_reader(c: &mut Criterion) {
    let mut group = c.benchmark_group("body_reader");

    for chunk_count in [16usize, 256, 4096] {
        let chunks: Vec<Bytes> = (0..chunk_count).map(|_| Bytes::from(vec![7u8; 256])).collect();
        let publisher = body::chunks(chunks);
        group.throughput(Throughput::Bytes(chunk_count as u64 * 256));
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_count),
            &publisher,
            |b, publisher| {
                b.iter(|| {
                    let (mut reader, subscriber) = BodyReader::new();
                    publisher.subscribe(Box::new(subscriber));
                    let mut total = 0;
                    while let Some(chunk) = reader.next_chunk().unwrap() {
                        total += chunk.len();
                    }
                    black_box(total)
                });
            },
        );
    }

    group.finish();
}

fn bench_lines(c: &mut Criterion) {
    let mut group = c.benchmark_group("lines");

    let text: String = (0..2000).map(|i| format!("line number {}\r\n", i)).collect();
    // Split so that some CRLF pairs straddle two chunks
    let chunks: Vec<Bytes> = text
        .as_bytes()
        .chunks(1000)
        .map(Bytes::copy_from_slice)
        .collect();
    let publisher = body::chunks(chunks);
    group.throughput(Throughput::Bytes(text.len() as u64));

    group.bench_function("crlf_utf8", |b| {
        b.iter(|| {
            let pull: Pull<String> = Pull::new();
            publisher.subscribe(Box::new(lines(Box::new(pull.subscriber()), Charset::utf8())));
            let mut count = 0;
            while let Some(line) = pull.next(None).unwrap() {
                black_box(line);
                count += 1;
            }
            assert_eq!(count, 2000);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_chunked_decode,
    bench_data_frames,
    bench_body_reader,
    bench_lines
);
criterion_main!(benches);
