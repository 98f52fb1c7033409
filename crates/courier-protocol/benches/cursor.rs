//! Cursor codec benchmarks for courier-protocol.

use courier_protocol::cursor::{self, CursorPosition};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn positions(count: usize) -> Vec<CursorPosition> {
    (0..count)
        .map(|i| CursorPosition::new(format!("group:room-{}", i), i as u64 * 1_000))
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for count in [1usize, 10, 100] {
        let cursors = positions(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("{}_cursors", count), |b| {
            b.iter(|| cursor::encode(black_box(&cursors)))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for count in [1usize, 10, 100] {
        let token = cursor::encode(&positions(count));
        group.throughput(Throughput::Bytes(token.len() as u64));
        group.bench_function(format!("{}_cursors", count), |b| {
            b.iter(|| cursor::decode(black_box(&token)))
        });
    }
    group.finish();
}

fn bench_escaped_roundtrip(c: &mut Criterion) {
    let cursors = vec![
        CursorPosition::new(r"hub\group,with|separators", 42),
        CursorPosition::new("plain", 7),
    ];

    c.bench_function("roundtrip_escaped", |b| {
        b.iter(|| {
            let token = cursor::encode(black_box(&cursors));
            cursor::decode(black_box(&token)).unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_escaped_roundtrip);
criterion_main!(benches);
