use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;

use memtune::config::{PoolConfig, SchedulerConfig};
use memtune::graph::ReferenceGraph;
use memtune::memory::{slope, CollectionScheduler};
use memtune::pool::{buffer_factory, shared_array_pool, BucketArrayPool, PoolOptions, Poolable, PooledBuffer, ResourcePool};
use memtune::runtime::{ManualCollector, ManualMemorySource};
use memtune::ManualClock;

#[derive(Default)]
struct Scratch {
    bytes: Vec<u8>,
}

impl Poolable for Scratch {
    fn reset(&mut self) {
        self.bytes.clear();
    }
}

/// Pooled checkout versus fresh construction
fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_release");

    group.bench_function("pooled", |b| {
        let mut pool = ResourcePool::new(PoolConfig::default(), Arc::new(ManualClock::new()));
        b.iter(|| {
            let mut scratch = pool.acquire::<Scratch>("scratch").unwrap();
            scratch.bytes.extend_from_slice(black_box(&[1u8; 512]));
            pool.release(scratch);
        });
    });

    group.bench_function("fresh", |b| {
        b.iter(|| {
            let mut scratch = Scratch {
                bytes: Vec::with_capacity(512),
            };
            scratch.bytes.extend_from_slice(black_box(&[1u8; 512]));
            black_box(scratch);
        });
    });

    group.finish();
}

/// String assembly through pooled buffers
fn bench_pooled_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("pooled_buffer");

    for fragments in [8usize, 64, 512].iter() {
        group.bench_with_input(BenchmarkId::new("fragments", fragments), fragments, |b, &fragments| {
            let arrays = shared_array_pool(BucketArrayPool::with_buckets(vec![16, 64, 256, 1024], 8).unwrap());
            let mut pool = ResourcePool::new(PoolConfig::default(), Arc::new(ManualClock::new()));
            pool.register_with_factory("buffer", PoolOptions::max_size(4), buffer_factory(arrays))
                .unwrap();

            b.iter(|| {
                let mut buffer = pool.acquire_registered::<PooledBuffer>("buffer").unwrap();
                for i in 0..fragments {
                    buffer.append(if i % 2 == 0 { "<td>" } else { "</td>" });
                }
                black_box(buffer.len());
                pool.release(buffer);
            });
        });
    }

    group.finish();
}

/// Cycle checks on long reference chains
fn bench_reference_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("reference_graph");

    for length in [100usize, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("chain", length), length, |b, &length| {
            let mut graph = ReferenceGraph::new();
            let ids: Vec<_> = (0..length).map(|_| graph.register("Node")).collect();
            for pair in ids.windows(2) {
                graph.track(pair[0], "next", pair[1]);
            }

            b.iter(|| black_box(graph.has_cycle(ids[0])));
        });
    }

    group.finish();
}

/// Scheduler tick overhead and trend estimation
fn bench_scheduler(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");

    group.bench_function("tick", |b| {
        let clock = ManualClock::new();
        let memory = ManualMemorySource::new(Some(1 << 30));
        memory.set_usage(256 << 20);
        let collector = ManualCollector::new();
        let mut scheduler = CollectionScheduler::new(
            SchedulerConfig::default(),
            Arc::new(memory.clone()),
            Arc::new(clock.clone()),
        )
        .unwrap()
        .with_collector(Arc::new(collector.clone()));

        b.iter(|| {
            clock.advance(Duration::from_secs(1));
            collector.add_garbage(50, 4096);
            black_box(scheduler.tick());
        });
    });

    let points: Vec<(f64, f64)> = (0..300).map(|i| (i as f64 * 10.0, (i * i) as f64)).collect();
    group.bench_function("slope_300", |b| b.iter(|| black_box(slope(black_box(&points)))));

    group.finish();
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_pooled_buffer,
    bench_reference_graph,
    bench_scheduler
);
criterion_main!(benches);
