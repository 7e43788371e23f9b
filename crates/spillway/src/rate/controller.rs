//! Per-second cap in front of an arbitrary timed call

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::counter::{SecondCounter, WindowStats};
use super::state::RateState;
use crate::error::{Error, Result};

/// A call that takes a configuration and a time budget
///
/// Implementations report `Disabled`/`Unavailable` through [`Error`]; the
/// controller propagates them unchanged.
#[async_trait]
pub trait TimedCall: Send + Sync {
    type Config: Send + Sync;
    type Output: Send;

    async fn call(&self, config: &Self::Config, timeout: Duration) -> Result<Self::Output>;
}

/// Rate controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateControlConfig {
    /// Calls admitted in any rolling second; zero rejects everything
    pub max_calls_per_second: u32,

    /// Seconds of history kept for [`RateController::window_stats`]
    pub window_seconds: usize,
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self {
            max_calls_per_second: 100,
            window_seconds: 60,
        }
    }
}

impl RateControlConfig {
    pub fn new(max_calls_per_second: u32) -> Self {
        Self {
            max_calls_per_second,
            ..Default::default()
        }
    }

    pub fn with_window_seconds(mut self, seconds: usize) -> Self {
        self.window_seconds = seconds;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.window_seconds == 0 {
            return Err("window_seconds must be at least 1".into());
        }
        Ok(())
    }
}

/// Outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateControlStats {
    pub admitted: u64,
    pub rejected: u64,
    pub cancelled: u64,
}

const WINDOW: Duration = Duration::from_secs(1);

/// Admits at most `max_calls_per_second` calls in any rolling one-second window
///
/// Admission keeps the instants of the last `cap` admitted calls; a call is
/// admitted only if the oldest of them is at least one second old. The check
/// and the record happen under one short lock, so the cap is exact under any
/// number of concurrent callers. Rejected calls never reach the wrapped call.
/// A call that overruns its budget still counts against the cap and is
/// reported as [`Error::Cancelled`].
pub struct RateController<C> {
    call: C,
    config: RateControlConfig,
    admissions: Mutex<VecDeque<Instant>>,
    counter: SecondCounter,
    state: RateState,
    admitted: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
}

impl<C: TimedCall> RateController<C> {
    pub fn new(call: C, config: RateControlConfig) -> Self {
        Self {
            admissions: Mutex::new(VecDeque::with_capacity(
                (config.max_calls_per_second as usize).min(4096),
            )),
            counter: SecondCounter::new(config.window_seconds),
            state: RateState::default(),
            call,
            config,
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    /// Run the wrapped call if the cap allows it
    #[instrument(skip(self, config), fields(cap = self.config.max_calls_per_second))]
    pub async fn attempt_call(&self, config: &C::Config, timeout: Duration) -> Result<C::Output> {
        if !self.state.is_enabled() {
            return Err(Error::Disabled);
        }

        let cap = self.config.max_calls_per_second;
        if cap == 0 {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::rate_exceeded(0, -1));
        }

        if let Err(retry_in) = self.try_admit(cap, Instant::now()) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            let wait_for_retry_millis = (retry_in.as_millis() as i64).max(1);
            debug!(wait_for_retry_millis, "Rate cap reached, call rejected");
            return Err(Error::rate_exceeded(cap, wait_for_retry_millis));
        }
        self.counter.increment();
        self.admitted.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(timeout, self.call.call(config, timeout)).await {
            Ok(result) => result,
            Err(_) => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Call exceeded its time budget"
                );
                Err(Error::Cancelled { limit: timeout })
            }
        }
    }

    /// Record an admission at `now` unless `cap` calls were admitted in the
    /// last second; on refusal, returns how long until the oldest expires
    fn try_admit(&self, cap: u32, now: Instant) -> std::result::Result<(), Duration> {
        let mut admissions = self.admissions.lock();
        while admissions
            .front()
            .is_some_and(|&at| now.duration_since(at) >= WINDOW)
        {
            admissions.pop_front();
        }
        if admissions.len() >= cap as usize {
            let oldest = admissions.front().copied().unwrap_or(now);
            return Err(WINDOW.saturating_sub(now.duration_since(oldest)));
        }
        admissions.push_back(now);
        Ok(())
    }

    /// Re-admit calls after [`disable`](Self::disable)
    pub fn enable(&self) {
        self.state.enable();
    }

    /// Reject every call with [`Error::Disabled`]
    pub fn disable(&self) {
        self.state.disable();
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    /// Admissions over the trailing `seconds` seconds
    pub fn window_stats(&self, seconds: usize) -> WindowStats {
        self.counter.window_stats(seconds)
    }

    pub fn stats(&self) -> RateControlStats {
        RateControlStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &RateControlConfig {
        &self.config
    }

    /// The wrapped call
    pub fn inner(&self) -> &C {
        &self.call
    }
}
