//! Hot-path benchmarks
//!
//! Measures the per-call cost producers pay: counting a second, passing the
//! rate cap, and handing an item to a bounded queue.

use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use spillway::rate::{PermitLimiter, SecondCounter};
use spillway::worker::BoundedQueue;

fn bench_counter(c: &mut Criterion) {
    let mut group = c.benchmark_group("second_counter");
    group.throughput(Throughput::Elements(1));

    let counter = SecondCounter::new(60);
    group.bench_function("increment", |b| b.iter(|| counter.increment()));

    let capped = SecondCounter::new(60);
    group.bench_function("try_increment_below_saturated", |b| {
        // Cap of zero: measures the rejection path only
        b.iter(|| capped.try_increment_below(0))
    });

    group.bench_function("window_stats_60s", |b| b.iter(|| counter.window_stats(60)));
    group.finish();
}

fn bench_contended_counter(c: &mut Criterion) {
    let mut group = c.benchmark_group("second_counter_contended");
    for threads in [2usize, 4, 8] {
        group.throughput(Throughput::Elements((threads * 10_000) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let counter = Arc::new(SecondCounter::new(60));
                std::thread::scope(|scope| {
                    for _ in 0..threads {
                        let counter = Arc::clone(&counter);
                        scope.spawn(move || {
                            for _ in 0..10_000 {
                                counter.increment();
                            }
                        });
                    }
                });
            })
        });
    }
    group.finish();
}

fn bench_limiter(c: &mut Criterion) {
    let limiter = PermitLimiter::new(u32::MAX);
    c.bench_function("permit_limiter/try_acquire", |b| b.iter(|| limiter.try_acquire()));
}

fn bench_queue(c: &mut Criterion) {
    let rt = Runtime::new().expect("failed to build runtime");
    let queue = BoundedQueue::new(1024);

    c.bench_function("bounded_queue/offer_poll", |b| {
        b.to_async(&rt).iter(|| async {
            queue.offer(1u64, Duration::ZERO).await.ok();
            queue.poll(Duration::ZERO).await
        })
    });
}

criterion_group!(
    benches,
    bench_counter,
    bench_contended_counter,
    bench_limiter,
    bench_queue
);
criterion_main!(benches);
