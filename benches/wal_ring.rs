use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use wolfrepl::wal::{DataState, WalCapacity, WalOp, WalRing};

fn upsert(i: u64) -> WalOp {
    WalOp::ItemUpsert {
        key: i.to_string(),
        item: Bytes::from(format!("{{\"id\":{}}}", i)),
    }
}

fn filled(capacity: usize, writes: u64) -> WalRing {
    let mut ring = WalRing::new("bench", 1, WalCapacity::records(capacity));
    for i in 0..writes {
        ring.append(upsert(i), DataState::default());
    }
    ring
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    for capacity in [100usize, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &capacity| {
            let mut ring = filled(capacity, capacity as u64);
            let mut i = capacity as u64;
            b.iter(|| {
                i += 1;
                black_box(ring.append(upsert(i), DataState::default()));
            });
        });
    }
    group.finish();
}

fn bench_read_after(c: &mut Criterion) {
    let ring = filled(10_000, 10_000);
    let mut group = c.benchmark_group("read_after");
    for tail in [10u64, 1_000, 9_000] {
        group.bench_with_input(BenchmarkId::from_parameter(tail), &tail, |b, &tail| {
            let after = Some(9_999 - tail);
            b.iter(|| black_box(ring.read_after(1, after)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append, bench_read_after);
criterion_main!(benches);
