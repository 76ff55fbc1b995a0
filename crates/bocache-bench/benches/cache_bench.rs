//! Allocator fast-path benchmarks.

use std::sync::Arc;

use bocache_core::{BoCache, BoFlags, Device, DeviceConfig, ManualClock, SimBackend, bucket_index};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn device() -> Device<SimBackend, Arc<ManualClock>> {
    Device::with_clock(
        SimBackend::new(),
        Arc::new(ManualClock::new(0)),
        DeviceConfig::default(),
    )
}

fn bench_bucket_index(c: &mut Criterion) {
    c.bench_function("bucket_index", |b| {
        let mut size = 1usize;
        b.iter(|| {
            size = size.wrapping_mul(33).wrapping_add(4093) & ((8 << 20) - 1);
            criterion::black_box(bucket_index(criterion::black_box(size)))
        });
    });
}

fn bench_cache_hit_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[4096, 16384, 65536, 1 << 20];
    let mut group = c.benchmark_group("create_unreference_hit");

    for &size in sizes {
        let dev = device();
        // Warm the cache so every iteration is a hit.
        let bo = dev.create(size, 0, BoFlags::NONE, "Bench").unwrap();
        dev.unreference(&bo);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &sz| {
            b.iter(|| {
                let bo = dev.create(sz, 0, BoFlags::NONE, "Bench").unwrap();
                dev.unreference(criterion::black_box(&bo));
            });
        });
    }
    group.finish();
}

fn bench_shared_bypass(c: &mut Criterion) {
    let dev = device();
    c.bench_function("create_unreference_shared", |b| {
        b.iter(|| {
            let bo = dev.create(16384, 0, BoFlags::SHARED, "Bench").unwrap();
            dev.unreference(criterion::black_box(&bo));
        });
    });
}

fn bench_first_fit_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("first_fit_scan");

    for &depth in &[16usize, 256] {
        let dev = device();
        // Fill one bucket with entries that never match the probe's flags.
        let decoys: Vec<_> = (0..depth)
            .map(|_| dev.create(65536, 0, BoFlags::EXEC, "Decoy").unwrap())
            .collect();
        for bo in &decoys {
            dev.unreference(bo);
        }
        let bo = dev.create(65536, 0, BoFlags::NONE, "Probe").unwrap();
        dev.unreference(&bo);

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                let bo = dev.create(65536, 0, BoFlags::NONE, "Probe").unwrap();
                dev.unreference(&bo);
            });
        });
    }
    group.finish();
}

fn bench_evict_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("evict_all");

    for &count in &[64usize, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &n| {
            let dev = device();
            b.iter(|| {
                let bos: Vec<_> = (0..n)
                    .map(|i| dev.create(4096 * (1 + i % 8), 0, BoFlags::NONE, "Evict").unwrap())
                    .collect();
                for bo in &bos {
                    dev.unreference(bo);
                }
                criterion::black_box(dev.evict_all())
            });
        });
    }
    group.finish();
}

fn bench_cache_store(c: &mut Criterion) {
    let dev = device();
    let bos: Vec<_> = (0..512)
        .map(|i| dev.create(4096 * (1 + i % 32), 0, BoFlags::NONE, "Store").unwrap())
        .collect();

    c.bench_function("bo_cache_put_fetch_512", |b| {
        b.iter(|| {
            let mut cache = BoCache::new();
            for bo in &bos {
                criterion::black_box(cache.put(Arc::clone(bo), 0));
            }
            for bo in &bos {
                criterion::black_box(cache.fetch(bo.size(), bo.align(), BoFlags::NONE));
            }
        });
    });

    for bo in &bos {
        dev.unreference(bo);
    }
}

criterion_group!(
    benches,
    bench_bucket_index,
    bench_cache_hit_cycle,
    bench_shared_bypass,
    bench_first_fit_scan,
    bench_evict_all,
    bench_cache_store
);
criterion_main!(benches);
