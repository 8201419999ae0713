use criterion::{Criterion, black_box, criterion_group, criterion_main};
use scopegc::{AllocOptions, Heap, HeapConfig, Trace, Tracer};

struct Payload {
    value: u64,
}

impl Trace for Payload {
    fn trace(&self, _tracer: &mut Tracer<'_>) {}
}

fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate");

    group.bench_function("alloc_10k_scoped", |b| {
        let heap = Heap::with_config(HeapConfig {
            gc_interval_bytes: 0,
        });
        b.iter(|| {
            let _scope = heap.scope();
            for i in 0..10_000u64 {
                black_box(heap.alloc(Payload { value: i }));
            }
            heap.collect();
        });
    });

    group.bench_function("alloc_10k_atomic", |b| {
        let heap = Heap::with_config(HeapConfig {
            gc_interval_bytes: 0,
        });
        b.iter(|| {
            let _scope = heap.scope();
            for i in 0..10_000u64 {
                black_box(heap.alloc_atomic(Payload { value: i }));
            }
            heap.collect();
        });
    });

    group.bench_function("alloc_10k_skip_drop", |b| {
        let heap = Heap::with_config(HeapConfig {
            gc_interval_bytes: 0,
        });
        b.iter(|| {
            let _scope = heap.scope();
            for i in 0..10_000u64 {
                black_box(heap.alloc_with_options(AllocOptions::skip_drop(), Payload { value: i }));
            }
            heap.collect();
        });
    });

    group.bench_function("alloc_collect_interval", |b| {
        let heap = Heap::with_config(HeapConfig {
            gc_interval_bytes: 64 * 1024,
        });
        b.iter(|| {
            let _scope = heap.scope();
            for i in 0..10_000u64 {
                heap.alloc(Payload { value: i }).clear();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_allocate);
criterion_main!(benches);
