//! Queue polling with idle backoff
//!
//! [`QueuePoller`] is the [`WorkUnit`] that turns a generic [`Worker`] into a
//! queue consumer: poll with a bounded timeout, hand items to the handler,
//! back off while idle.
//!
//! [`Worker`]: super::Worker

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use super::lifecycle::{panic_message, ExitReason, StopSignal, WorkError, WorkUnit};
use super::queue::BoundedQueue;
use crate::config::duration_millis;

/// Outcome of handling one item
pub type HandlerResult = Result<(), String>;

/// Per-item handler shared by the workers of a pool
pub type ItemHandler<T> =
    Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

/// Wrap an async closure as an [`ItemHandler`]
pub fn item_handler<T, F, Fut>(handler: F) -> ItemHandler<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |item| Box::pin(handler(item)))
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollerConfig {
    /// How long a single poll waits for an item
    #[serde(with = "duration_millis")]
    pub poll_timeout: Duration,

    /// Idle sleep after the first empty poll
    #[serde(with = "duration_millis")]
    pub min_idle_interval: Duration,

    /// Upper bound for the idle sleep
    #[serde(with = "duration_millis")]
    pub max_idle_interval: Duration,

    /// Growth factor applied to the idle sleep on consecutive empty polls
    pub idle_backoff_multiplier: f64,

    /// Jitter factor (0.0-1.0) applied to idle sleeps so workers drift apart
    pub idle_jitter: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            min_idle_interval: Duration::from_millis(10),
            max_idle_interval: Duration::from_millis(500),
            idle_backoff_multiplier: 2.0,
            idle_jitter: 0.1,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-poll wait
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set minimum idle interval
    pub fn with_min_idle_interval(mut self, interval: Duration) -> Self {
        self.min_idle_interval = interval;
        self
    }

    /// Set maximum idle interval
    pub fn with_max_idle_interval(mut self, interval: Duration) -> Self {
        self.max_idle_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_idle_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.idle_backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_idle_jitter(mut self, jitter: f64) -> Self {
        self.idle_jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.min_idle_interval > self.max_idle_interval {
            return Err("min_idle_interval must not exceed max_idle_interval".into());
        }
        Ok(())
    }
}

/// Switches and counters shared between a pool and all of its pollers
#[derive(Debug, Default)]
pub struct PollerShared {
    /// Process remaining queued items before stopping
    pub(crate) drain_on_stop: AtomicBool,
    /// Per-item debug logging
    pub(crate) debug: AtomicBool,
    /// Wakes idle pollers early
    pub(crate) wake: Notify,
    pub(crate) processed: AtomicU64,
    pub(crate) failed: AtomicU64,
}

impl PollerShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Work unit that consumes a shared queue
pub struct QueuePoller<T> {
    name: String,
    queue: Arc<BoundedQueue<T>>,
    handler: ItemHandler<T>,
    config: PollerConfig,
    current_idle: Duration,
    shared: Arc<PollerShared>,
    processed: Arc<AtomicU64>,
}

impl<T: Send + 'static> QueuePoller<T> {
    /// Create a new queue poller
    pub fn new(
        name: impl Into<String>,
        queue: Arc<BoundedQueue<T>>,
        handler: ItemHandler<T>,
        config: PollerConfig,
        shared: Arc<PollerShared>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            handler,
            current_idle: config.min_idle_interval,
            config,
            shared,
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count of items this poller handled successfully
    pub fn processed_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.processed)
    }

    /// Get the current idle interval
    pub fn current_idle_interval(&self) -> Duration {
        self.current_idle
    }

    async fn process(&self, item: T) {
        let started = Instant::now();
        let outcome = AssertUnwindSafe((self.handler)(item)).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                self.shared.processed.fetch_add(1, Ordering::Relaxed);
                if self.shared.debug.load(Ordering::Relaxed) {
                    debug!(
                        worker = %self.name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Item processed"
                    );
                }
            }
            Ok(Err(e)) => {
                self.shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = %self.name, error = %e, "Item handler failed");
            }
            Err(panic) => {
                self.shared.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker = %self.name,
                    panic = %panic_message(&*panic),
                    "Item handler panicked"
                );
            }
        }
    }

    async fn idle(&mut self, stop: &mut StopSignal) {
        let sleep_for = self.jittered(self.current_idle);
        let shared = Arc::clone(&self.shared);
        let woken = tokio::select! {
            _ = tokio::time::sleep(sleep_for) => Some(false),
            _ = shared.wake.notified() => Some(true),
            _ = stop.stopped() => None,
        };
        match woken {
            Some(false) => self.increase_backoff(),
            Some(true) => self.reset_backoff(),
            None => {}
        }
    }

    fn jittered(&self, interval: Duration) -> Duration {
        if self.config.idle_jitter <= 0.0 || interval.is_zero() {
            return interval;
        }
        let factor = rand::thread_rng()
            .gen_range(1.0 - self.config.idle_jitter..=1.0 + self.config.idle_jitter);
        Duration::from_secs_f64(interval.as_secs_f64() * factor)
    }

    /// Reset backoff to minimum interval
    fn reset_backoff(&mut self) {
        self.current_idle = self.config.min_idle_interval;
    }

    /// Increase backoff interval
    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_idle.as_secs_f64() * self.config.idle_backoff_multiplier,
        );
        self.current_idle = next.min(self.config.max_idle_interval);
    }
}

#[async_trait]
impl<T: Send + 'static> WorkUnit for QueuePoller<T> {
    async fn run_once(&mut self, stop: &mut StopSignal) -> Result<(), WorkError> {
        let polled = tokio::select! {
            item = self.queue.poll(self.config.poll_timeout) => item,
            _ = stop.stopped() => return Ok(()),
        };

        match polled {
            Some(item) => {
                self.reset_backoff();
                self.process(item).await;
            }
            None => {
                trace!(
                    worker = %self.name,
                    idle_ms = self.current_idle.as_millis() as u64,
                    "Queue empty, idling"
                );
                self.idle(stop).await;
            }
        }
        Ok(())
    }

    async fn on_shutdown(&mut self, _reason: &ExitReason) {
        if !self.shared.drain_on_stop.load(Ordering::SeqCst) {
            return;
        }

        let mut drained = 0usize;
        while let Some(item) = self.queue.try_poll() {
            self.process(item).await;
            drained += 1;
        }
        if drained > 0 {
            info!(worker = %self.name, drained, "Drained queue before stopping");
        }
    }
}
