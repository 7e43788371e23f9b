//! End-to-end worker pool scenarios

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use spillway::worker::{item_handler, ElasticPool, PollerConfig, PoolConfig, PoolStatus};

fn fast_poller() -> PollerConfig {
    PollerConfig::new()
        .with_poll_timeout(Duration::from_millis(20))
        .with_min_idle_interval(Duration::from_millis(2))
        .with_max_idle_interval(Duration::from_millis(20))
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_every_offered_item_processed_exactly_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        item_handler(move |item: u32| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(item);
                Ok(())
            }
        })
    };

    let pool = ElasticPool::with_handler(
        PoolConfig::new("exactly-once")
            .with_workers(4, 4)
            .with_queue_capacity(32)
            .with_poller(fast_poller()),
        handler,
    )
    .unwrap();
    pool.start().await.unwrap();

    for item in 0..1_000u32 {
        assert!(pool.offer(item, Duration::from_secs(5)).await, "offer {item} timed out");
    }
    pool.shutdown(true).await.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1_000);
    let unique: HashSet<u32> = seen.iter().copied().collect();
    assert_eq!(unique.len(), 1_000);

    let stats = pool.stats();
    assert_eq!(stats.offered, 1_000);
    assert_eq!(stats.processed, 1_000);
    assert_eq!(stats.discarded, 0);
    assert_eq!(pool.status(), PoolStatus::Stopped);
}

#[test_log::test(tokio::test)]
async fn test_zero_timeout_offer_never_waits() {
    let gate = Arc::new(Semaphore::new(0));
    let handler = {
        let gate = Arc::clone(&gate);
        item_handler(move |_item: u32| {
            let gate = Arc::clone(&gate);
            async move {
                let _permit = gate.acquire().await.map_err(|e| e.to_string())?;
                Ok(())
            }
        })
    };

    let pool = ElasticPool::with_handler(
        PoolConfig::new("zero-wait")
            .with_workers(1, 1)
            .with_queue_capacity(1)
            .with_poller(fast_poller()),
        handler,
    )
    .unwrap();
    pool.start().await.unwrap();

    // One item in the handler, one in the queue: the third offer must fail
    let mut refused = 0;
    for item in 0..3u32 {
        let started = Instant::now();
        if !pool.offer(item, Duration::ZERO).await {
            refused += 1;
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }
    assert!(refused >= 1);
    assert!(pool.stats().rejected >= 1);

    gate.add_permits(16);
    pool.shutdown(true).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_handler_failures_do_not_stop_workers() {
    let handler = item_handler(|item: u32| async move {
        if item % 2 == 1 {
            Err(format!("odd item {item}"))
        } else {
            Ok(())
        }
    });

    let pool = ElasticPool::with_handler(
        PoolConfig::new("failing")
            .with_workers(2, 2)
            .with_poller(fast_poller()),
        handler,
    )
    .unwrap();
    pool.start().await.unwrap();

    for item in 0..100u32 {
        assert!(pool.offer(item, Duration::from_secs(1)).await);
    }
    pool.shutdown(true).await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.processed, 50);
    assert_eq!(stats.failed, 50);
}

#[test_log::test(tokio::test)]
async fn test_panicking_handler_is_contained() {
    let calls = Arc::new(AtomicU64::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        item_handler(move |item: u32| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if item == 3 {
                    panic!("bad item");
                }
                Ok(())
            }
        })
    };

    let pool = ElasticPool::with_handler(
        PoolConfig::new("panics")
            .with_workers(1, 1)
            .with_poller(fast_poller()),
        handler,
    )
    .unwrap();
    pool.start().await.unwrap();

    for item in 0..10u32 {
        assert!(pool.offer(item, Duration::from_secs(1)).await);
    }
    pool.shutdown(true).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 10);
    let stats = pool.stats();
    assert_eq!(stats.processed, 9);
    assert_eq!(stats.failed, 1);
}

#[test_log::test(tokio::test)]
async fn test_repeated_shutdown_is_idempotent() {
    let pool = ElasticPool::with_handler(
        PoolConfig::new("twice").with_workers(2, 2).with_poller(fast_poller()),
        item_handler(|_item: u32| async { Ok(()) }),
    )
    .unwrap();
    pool.start().await.unwrap();
    assert!(pool.is_alive());

    pool.shutdown(true).await.unwrap();
    pool.shutdown(false).await.unwrap();

    assert!(!pool.is_alive());
    assert_eq!(pool.active_count(), 0);
    assert!(!pool.offer(1, Duration::ZERO).await);
}
