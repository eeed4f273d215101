//! Basic benchmarks for the `block_heap` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::alloc::Layout;
use std::hint::black_box;
use std::iter;
use std::num::NonZero;
use std::time::Instant;

use alloc_tracker::Allocator;
use block_heap::BlockHeap;
use criterion::{Criterion, criterion_group, criterion_main};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

const SLOT_LAYOUT: Layout = Layout::new::<u64>();

fn entrypoint(c: &mut Criterion) {
    let allocs = alloc_tracker::Session::new();

    let mut group = c.benchmark_group("bh_basic");

    let allocs_op = allocs.operation("build_empty");
    group.bench_function("build_empty", |b| {
        b.iter_custom(|iters| {
            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(
                    BlockHeap::builder().layout(SLOT_LAYOUT).build(),
                ));
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("first_allocation_grows");
    group.bench_function("first_allocation_grows", |b| {
        b.iter_custom(|iters| {
            let mut heaps =
                iter::repeat_with(|| BlockHeap::builder().layout(SLOT_LAYOUT).build())
                    .take(usize::try_from(iters).unwrap())
                    .collect::<Vec<_>>();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for heap in &mut heaps {
                _ = black_box(heap.allocate());
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("allocate_one_steady");
    group.bench_function("allocate_one_steady", |b| {
        b.iter_custom(|iters| {
            let mut heaps = iter::repeat_with(|| {
                BlockHeap::builder()
                    .layout(SLOT_LAYOUT)
                    .eager_growth()
                    .build()
            })
            .take(usize::try_from(iters).unwrap())
            .collect::<Vec<_>>();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for heap in &mut heaps {
                _ = black_box(heap.allocate());
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("allocate_free_pair");
    group.bench_function("allocate_free_pair", |b| {
        b.iter_custom(|iters| {
            let mut heap = BlockHeap::builder()
                .layout(SLOT_LAYOUT)
                .eager_growth()
                .build();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let slot = heap.allocate().expect("heap bookkeeping is intact");
                heap.free(black_box(slot));
            }

            start.elapsed()
        });
    });

    group.finish();

    let mut group = c.benchmark_group("bh_slow");

    let allocs_op = allocs.operation("fill_10k");
    group.bench_function("fill_10k", |b| {
        b.iter_custom(|iters| {
            let mut heaps =
                iter::repeat_with(|| BlockHeap::builder().layout(SLOT_LAYOUT).build())
                    .take(usize::try_from(iters).unwrap())
                    .collect::<Vec<_>>();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for heap in &mut heaps {
                for _ in 0..10_000 {
                    _ = black_box(heap.allocate());
                }
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("forward_10_back_5_times_1000");
    group.bench_function("forward_10_back_5_times_1000", |b| {
        // We take 10 slots, free the first 5 and repeat this 1000 times.
        // This stresses the block scan and the vacancy cache.
        b.iter_custom(|iters| {
            let batch = NonZero::new(128).unwrap();

            let mut heaps = iter::repeat_with(|| {
                BlockHeap::builder()
                    .layout(SLOT_LAYOUT)
                    .slots_per_block(batch)
                    .build()
            })
            .take(usize::try_from(iters).unwrap())
            .collect::<Vec<_>>();

            let mut taken = Vec::with_capacity(10);

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for heap in &mut heaps {
                for _ in 0..1000 {
                    for _ in 0..10 {
                        taken.push(heap.allocate().expect("heap bookkeeping is intact"));
                    }

                    for slot in taken.drain(..5) {
                        heap.free(slot);
                    }

                    taken.clear();
                }
            }

            start.elapsed()
        });
    });

    group.finish();

    allocs.print_to_stdout();
}
