//! Rate counter and controller scenarios

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use spillway::rate::{PermitLimiter, RateControlConfig, RateController, SecondCounter, TimedCall};
use spillway::{Error, ErrorKind};

/// Counts invocations that actually reach the wrapped call
#[derive(Default)]
struct CountingCall {
    invoked: AtomicU64,
}

#[async_trait]
impl TimedCall for CountingCall {
    type Config = ();
    type Output = u64;

    async fn call(&self, _config: &(), _timeout: Duration) -> spillway::Result<u64> {
        Ok(self.invoked.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[test]
fn test_concurrent_increments_are_never_lost() {
    let counter = SecondCounter::new(10);
    let second = 1_700_000_000u64;

    std::thread::scope(|scope| {
        for _ in 0..16 {
            scope.spawn(|| {
                for _ in 0..5_000 {
                    counter.increment_at(second);
                }
            });
        }
    });

    assert_eq!(counter.count_at(second), 80_000);
    let stats = counter.window_stats_at(second, 1);
    assert_eq!(stats.total, 80_000);
}

#[test_log::test(tokio::test)]
async fn test_burst_over_cap_splits_into_admitted_and_rejected() {
    let controller = RateController::new(CountingCall::default(), RateControlConfig::new(100));

    let mut ok = 0;
    let mut limited = 0;
    for _ in 0..150 {
        match controller.attempt_call(&(), Duration::from_secs(1)).await {
            Ok(_) => ok += 1,
            Err(Error::RateExceeded {
                rate,
                wait_for_retry_millis,
            }) => {
                assert_eq!(rate, 100);
                assert!(wait_for_retry_millis >= 1);
                limited += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(ok, 100);
    assert_eq!(limited, 50);
    assert_eq!(controller.inner().invoked.load(Ordering::SeqCst), 100);

    let stats = controller.stats();
    assert_eq!(stats.admitted, 100);
    assert_eq!(stats.rejected, 50);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 8))]
async fn test_cap_holds_across_concurrent_callers() {
    let controller = Arc::new(RateController::new(
        CountingCall::default(),
        RateControlConfig::new(40),
    ));

    let tasks: Vec<_> = (0..200)
        .map(|_| {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.attempt_call(&(), Duration::from_secs(1)).await })
        })
        .collect();

    let mut ok = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::RateExceeded),
        }
    }

    assert_eq!(ok, 40);
    assert_eq!(controller.inner().invoked.load(Ordering::SeqCst), 40);
}

#[test_log::test(tokio::test)]
async fn test_capacity_returns_after_window_passes() {
    let controller = RateController::new(CountingCall::default(), RateControlConfig::new(5));

    for _ in 0..5 {
        controller
            .attempt_call(&(), Duration::from_secs(1))
            .await
            .unwrap();
    }
    let err = controller
        .attempt_call(&(), Duration::from_secs(1))
        .await
        .unwrap_err();
    let retry = err.retry_after().expect("rate errors carry a retry hint");
    assert!(retry <= Duration::from_secs(1));

    tokio::time::sleep(Duration::from_millis(1_050)).await;
    controller
        .attempt_call(&(), Duration::from_secs(1))
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn test_disabled_controller_never_invokes_call() {
    let controller = RateController::new(CountingCall::default(), RateControlConfig::new(10));
    controller.disable();

    let err = controller
        .attempt_call(&(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Disabled);
    assert!(!err.is_retryable());
    assert_eq!(controller.inner().invoked.load(Ordering::SeqCst), 0);

    controller.enable();
    assert_eq!(
        controller.attempt_call(&(), Duration::from_secs(1)).await.unwrap(),
        1
    );
}

#[test_log::test(tokio::test)]
async fn test_limiter_zero_wait_returns_immediately_when_empty() {
    let limiter = PermitLimiter::new(3);
    for _ in 0..3 {
        assert!(limiter.acquire(Duration::ZERO).await);
    }

    let started = std::time::Instant::now();
    assert!(!limiter.acquire(Duration::ZERO).await);
    assert!(started.elapsed() < Duration::from_millis(50));
}
