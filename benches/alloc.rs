//! Run with:
//!   cargo bench --bench alloc

use criterion::{
    BatchSize, Criterion, black_box, criterion_group, criterion_main,
};
use marksweep::{CollectOptions, Heap, HeapSettings, stack_anchor};

fn bench_settings() -> HeapSettings {
    HeapSettings {
        heap_size: 1024 * 1024, // 1 MiB, far above what one batch allocates
        max_alloc: 1024 * 1024,
        ..HeapSettings::default()
    }
}

/// Benchmark 1: fresh bump allocation, no recycling involved.
fn bench_fresh_alloc(c: &mut Criterion) {
    c.bench_function("fresh_alloc_64", |b| {
        b.iter_batched(
            || Heap::new(bench_settings(), stack_anchor()),
            |mut heap| {
                for _ in 0..1024 {
                    black_box(heap.alloc(black_box(64)));
                }
                heap
            },
            BatchSize::SmallInput,
        );
    });
}

/// Benchmark 2: sweep + free followed by recycle-dominated allocation.
fn bench_collect_cycle(c: &mut Criterion) {
    let mut heap = Heap::new(bench_settings(), stack_anchor());

    c.bench_function("sweep_free_then_alloc_64", |b| {
        b.iter(|| {
            heap.collect_with(CollectOptions::SWEEP | CollectOptions::FREE);
            for _ in 0..1024 {
                black_box(heap.alloc(black_box(64)));
            }
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(30);
    targets = bench_fresh_alloc, bench_collect_cycle
}

criterion_main!(benches);
