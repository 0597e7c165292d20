//! Benchmarks for wrapper lifetime management
//!
//! Measures:
//! - Register + dispose (immediate release)
//! - Drop + drain (deferred release)
//! - Drains with varying batch sizes
//! - Exception capture

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use refbridge::exceptions;
use refbridge::{BridgeConfig, BridgeRuntime, ForeignException, ForeignObject};
use std::hint::black_box;

fn runtime(validate: bool) -> std::sync::Arc<BridgeRuntime> {
    BridgeRuntime::initialize(
        BridgeConfig::default()
            .with_threshold(usize::MAX)
            .with_refcount_validation(validate),
    )
}

/// Benchmark: Wrap and release immediately
fn bench_register_dispose(c: &mut Criterion) {
    let runtime = runtime(false);
    let mut gil = runtime.lock();

    c.bench_function("register_dispose", |b| {
        b.iter(|| {
            let obj = ForeignObject::int(&mut gil, black_box(42)).unwrap();
            obj.dispose(&mut gil).unwrap();
        });
    });
}

/// Benchmark: Drop a wrapper and drain it on the next collection
fn bench_drop_collect(c: &mut Criterion) {
    let runtime = runtime(false);
    let mut gil = runtime.lock();

    c.bench_function("drop_collect", |b| {
        b.iter(|| {
            drop(ForeignObject::int(&mut gil, black_box(42)).unwrap());
            black_box(gil.collect().unwrap());
        });
    });
}

/// Benchmark: Drain throughput with varying batch sizes, with and without validation
fn bench_drain_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_batch");

    for validate in [false, true] {
        let runtime = runtime(validate);
        let label = if validate { "validated" } else { "unchecked" };

        for size in [10, 100, 1000] {
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, &size| {
                let mut gil = runtime.lock();

                b.iter(|| {
                    for i in 0..size {
                        drop(ForeignObject::int(&mut gil, i).unwrap());
                    }
                    black_box(gil.collect().unwrap());
                });
            });
        }
    }
    group.finish();
}

/// Benchmark: Drain triggered by registration at the threshold
fn bench_threshold(c: &mut Criterion) {
    let mut group = c.benchmark_group("threshold");

    for threshold in [1, 50, 200] {
        group.bench_with_input(
            BenchmarkId::new("threshold", threshold),
            &threshold,
            |b, &threshold| {
                let runtime =
                    BridgeRuntime::initialize(BridgeConfig::default().with_threshold(threshold));
                let mut gil = runtime.lock();

                b.iter(|| {
                    // Registration drains once the queue reaches the threshold
                    for i in 0..200 {
                        drop(ForeignObject::int(&mut gil, i).unwrap());
                    }
                });

                gil.collect().unwrap();
            },
        );
    }
    group.finish();
}

/// Benchmark: Capture a pending foreign error
fn bench_exception_fetch(c: &mut Criterion) {
    let runtime = runtime(false);
    let mut gil = runtime.lock();
    let value_error = gil.exceptions().value_error.unwrap();

    c.bench_function("exception_fetch", |b| {
        b.iter(|| {
            exceptions::set_error(&mut gil, value_error, "bench").unwrap();
            let exc = ForeignException::fetch(&mut gil).unwrap();
            drop(black_box(exc));
            gil.collect().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_register_dispose,
    bench_drop_collect,
    bench_drain_batch,
    bench_threshold,
    bench_exception_fetch,
);
criterion_main!(benches);
