use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stealpool::{Config, ThreadPool};
use std::hint::black_box;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Countdown latch: tasks decrement, the bench thread waits for zero.
struct Latch {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl Latch {
    fn new(count: usize) -> Arc<Latch> {
        Arc::new(Latch {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        })
    }

    fn count_down(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining -= 1;
        if *remaining == 0 {
            self.zero.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.zero.wait(remaining).unwrap();
        }
    }
}

fn submit_and_wait(pool: &ThreadPool, count: usize) {
    let latch = Latch::new(count);
    for i in 0..count {
        let latch = latch.clone();
        pool.submit(move || {
            black_box(i);
            latch.count_down();
        })
        .unwrap();
    }
    latch.wait();
}

// Benchmark 1: submission + execution throughput for empty tasks
fn bench_submit_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_throughput");

    for size in [100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("cpu_bound", size), &size, |b, &size| {
            let pool = ThreadPool::with_config(Config::cpu_bound()).unwrap();
            b.iter(|| submit_and_wait(&pool, size));
            pool.shutdown();
        });
    }

    group.finish();
}

// Benchmark 2: small CPU-bound payloads, fixed pool vs single worker
fn bench_parallel_speedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_speedup");
    group.measurement_time(Duration::from_secs(10));

    fn busy_work(iters: u64) -> u64 {
        let mut acc = 0u64;
        for i in 0..iters {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
        acc
    }

    for workers in [1, num_cpus::get()] {
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                let pool = ThreadPool::with_bounds(workers, workers).unwrap();
                b.iter(|| {
                    let latch = Latch::new(64);
                    for _ in 0..64 {
                        let latch = latch.clone();
                        pool.submit(move || {
                            black_box(busy_work(10_000));
                            latch.count_down();
                        })
                        .unwrap();
                    }
                    latch.wait();
                });
                pool.shutdown();
            },
        );
    }

    group.finish();
}

// Benchmark 3: cost of a burst that forces the pool to grow
fn bench_elastic_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("elastic_growth");
    group.sample_size(20);

    group.bench_function("burst_from_min", |b| {
        b.iter(|| {
            let mut config = Config::new(1, num_cpus::get());
            config.grow_cooldown = Duration::from_micros(100);
            let pool = ThreadPool::with_config(config).unwrap();
            submit_and_wait(&pool, 1_000);
            pool.shutdown();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_submit_throughput,
    bench_parallel_speedup,
    bench_elastic_growth
);
criterion_main!(benches);
