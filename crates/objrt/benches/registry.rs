// Class registry benchmarks
//
// This benchmark suite measures:
// - Fetch hits and misses against a populated registry
// - Registration into fresh and crowded registries
// - FxHash against aHash for short class names
// - Concurrent fetch from several threads

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use fxhash::FxBuildHasher;
use objrt::runtime::LockFreeRegistry;
use std::sync::Arc;
use std::thread;

fn class_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("Index::Analysis::Class{i}")).collect()
}

fn populated(names: &[String], capacity: usize) -> LockFreeRegistry<usize> {
    let registry = LockFreeRegistry::new(capacity);
    for (i, name) in names.iter().enumerate() {
        registry.register(name, i);
    }
    registry
}

/// Benchmark fetch of a registered key at several load factors
fn bench_fetch_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch_hit");
    for count in [64, 256, 1024, 4096] {
        let names = class_names(count);
        let registry = populated(&names, 256);
        group.bench_with_input(BenchmarkId::from_parameter(count), &names, |b, names| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % names.len();
                black_box(registry.fetch(black_box(&names[i])))
            })
        });
    }
    group.finish();
}

/// Benchmark fetch of a key that was never registered
fn bench_fetch_miss(c: &mut Criterion) {
    let names = class_names(1024);
    let registry = populated(&names, 256);
    c.bench_function("fetch_miss", |b| {
        b.iter(|| black_box(registry.fetch(black_box("Index::Missing"))))
    });
}

/// Benchmark filling an empty registry
fn bench_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("register");
    for count in [64, 1024] {
        let names = class_names(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &names, |b, names| {
            b.iter(|| {
                let registry = LockFreeRegistry::new(256);
                for (i, name) in names.iter().enumerate() {
                    registry.register(name, i);
                }
                black_box(registry.len())
            })
        });
    }
    group.finish();
}

/// Compare hashers on the fetch path
fn bench_hasher(c: &mut Criterion) {
    let names = class_names(1024);
    let mut group = c.benchmark_group("hasher");

    let fx = LockFreeRegistry::with_hasher(256, FxBuildHasher::default());
    let ahash = LockFreeRegistry::with_hasher(256, ahash::RandomState::new());
    for (i, name) in names.iter().enumerate() {
        fx.register(name, i);
        ahash.register(name, i);
    }

    group.bench_function("fxhash", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % names.len();
            black_box(fx.fetch(&names[i]))
        })
    });
    group.bench_function("ahash", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % names.len();
            black_box(ahash.fetch(&names[i]))
        })
    });
    group.finish();
}

/// Benchmark fetch while other threads read the same registry
fn bench_concurrent_fetch(c: &mut Criterion) {
    let names = Arc::new(class_names(1024));
    let registry = Arc::new(populated(&names, 256));
    let mut group = c.benchmark_group("concurrent_fetch");

    for threads in [1, 2, 4, 8] {
        group.throughput(Throughput::Elements((threads * names.len()) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let names = Arc::clone(&names);
                        let registry = Arc::clone(&registry);
                        thread::spawn(move || {
                            names
                                .iter()
                                .filter(|name| registry.fetch(name).is_some())
                                .count()
                        })
                    })
                    .collect();
                for handle in handles {
                    black_box(handle.join().unwrap());
                }
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_fetch_hit,
    bench_fetch_miss,
    bench_register,
    bench_hasher,
    bench_concurrent_fetch
);

criterion_main!(benches);
