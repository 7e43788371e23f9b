//! Token-bucket permit limiter
//!
//! Refills `permits_per_second` tokens per second with one second of burst.
//! Waiters reserve a token under the lock and sleep outside it, so the lock
//! is never held across a wait.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Permits-per-second limiter with bounded waits
#[derive(Debug)]
pub struct PermitLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl PermitLimiter {
    /// Create a limiter starting with a full bucket
    ///
    /// A rate of zero never grants permits.
    pub fn new(permits_per_second: u32) -> Self {
        let rate = f64::from(permits_per_second);
        Self {
            rate,
            burst: rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn permits_per_second(&self) -> u32 {
        self.rate as u32
    }

    /// Take a permit if one is available right now
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a permit, waiting at most `wait` for one to accrue
    ///
    /// Returns `false` without waiting when the next permit cannot arrive
    /// within `wait`. A zero wait behaves like [`try_acquire`](Self::try_acquire).
    pub async fn acquire(&self, wait: Duration) -> bool {
        if wait.is_zero() || self.rate <= 0.0 {
            return self.try_acquire();
        }

        let ready_at = {
            let mut bucket = self.bucket.lock();
            let now = Instant::now();
            self.refill(&mut bucket, now);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return true;
            }
            let shortfall = 1.0 - bucket.tokens;
            let delay = Duration::from_secs_f64(shortfall / self.rate);
            if delay > wait {
                return false;
            }
            // Reserve now; the debt is repaid by the refill while we sleep
            bucket.tokens -= 1.0;
            now + delay
        };

        tokio::time::sleep_until(ready_at).await;
        true
    }

    /// Permits available right now
    pub fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens.max(0.0) as u32
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_exhausted() {
        let limiter = PermitLimiter::new(5);
        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_zero_rate_never_grants() {
        let limiter = PermitLimiter::new(0);
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test]
    async fn test_zero_wait_returns_immediately() {
        let limiter = PermitLimiter::new(1);
        assert!(limiter.acquire(Duration::ZERO).await);

        let started = std::time::Instant::now();
        assert!(!limiter.acquire(Duration::ZERO).await);
        assert!(started.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_acquire_gives_up_when_permit_cannot_arrive_in_time() {
        let limiter = PermitLimiter::new(1);
        assert!(limiter.try_acquire());

        let started = std::time::Instant::now();
        // Next permit is ~1s away
        assert!(!limiter.acquire(Duration::from_millis(50)).await);
        assert!(started.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let limiter = PermitLimiter::new(100);
        for _ in 0..100 {
            assert!(limiter.try_acquire());
        }

        let started = std::time::Instant::now();
        assert!(limiter.acquire(Duration::from_millis(200)).await);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(5));
        assert!(waited < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_refill_caps_at_burst() {
        let limiter = PermitLimiter::new(50);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(limiter.available() <= 50);
    }
}
