//! 🏎️ Ring buffer and stream framing benchmarks.
//!
//! - `ring_cycle`: publish then release spans of various sizes, wrapping constantly.
//! - `decode_part`: a part of many small arrays through the full ring-backed decoder.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use wbx::codec::RecordBatchCodec;
use wbx::common::{FieldSchema, FieldType, TableSchema};
use wbx::ring_buffer::RingBuffer;

fn bench_ring_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_cycle");
    let capacity = 64 * 1024;

    for span in [64usize, 4096, 32 * 1024] {
        group.throughput(Throughput::Bytes(span as u64));
        group.bench_with_input(BenchmarkId::from_parameter(span), &span, |b, &span| {
            let mut ring = RingBuffer::new(capacity);
            b.iter(|| {
                ring.write(black_box(span)).unwrap();
                ring.read(black_box(span)).unwrap();
                black_box(ring.write_offset())
            })
        });
    }

    group.finish();
}

fn part_bytes(arrays: usize, rows_per_array: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    for a in 0..arrays {
        bytes.push(b'[');
        for r in 0..rows_per_array {
            if r > 0 {
                bytes.push(b',');
            }
            bytes.extend_from_slice(
                format!(r#"{{"text":"row \"{a}-{r}\" [not a bracket]","integer":{r},"boolean":true}}"#).as_bytes(),
            );
        }
        bytes.extend_from_slice(b"]\n");
    }
    bytes
}

fn bench_decode_part(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let codec = RecordBatchCodec::new(Arc::new(TableSchema::new(vec![
        FieldSchema::new("text", FieldType::String),
        FieldSchema::new("integer", FieldType::Integer),
        FieldSchema::new("boolean", FieldType::Boolean),
    ])));
    let bytes = part_bytes(200, 50);

    let mut group = c.benchmark_group("decode_part");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    for max_batch_bytes in [8 * 1024usize, 1024 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(max_batch_bytes),
            &max_batch_bytes,
            |b, &max_batch_bytes| {
                b.to_async(&runtime).iter(|| async {
                    let mut decoder = codec.stream_decoder("bench", bytes.as_slice(), max_batch_bytes);
                    let mut rows = 0usize;
                    while let Some(batch) = decoder.next_batch().await.unwrap() {
                        rows += batch.len();
                    }
                    black_box(rows)
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_ring_cycle, bench_decode_part);
criterion_main!(benches);
