//! Enabled switch plus a throttled trigger

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug)]
struct Inner {
    enabled: bool,
    last_triggered: Option<(Instant, DateTime<Utc>)>,
}

/// Enabled/disabled state with a trigger that fires at most once per interval
///
/// All three operations run under one short lock.
#[derive(Debug)]
pub struct RateState {
    inner: Mutex<Inner>,
    min_interval: Duration,
}

impl RateState {
    /// Create an enabled state whose trigger fires at most once per `min_interval`
    pub fn new(min_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                enabled: true,
                last_triggered: None,
            }),
            min_interval,
        }
    }

    pub fn enable(&self) {
        self.inner.lock().enabled = true;
    }

    pub fn disable(&self) {
        self.inner.lock().enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Record a trigger if enabled and the last one is at least `min_interval` old
    ///
    /// Returns whether this call fired.
    pub fn trigger(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return false;
        }
        let now = Instant::now();
        let due = match inner.last_triggered {
            Some((at, _)) => now.duration_since(at) >= self.min_interval,
            None => true,
        };
        if due {
            inner.last_triggered = Some((now, Utc::now()));
        }
        due
    }

    /// Wall-clock time of the last successful trigger
    pub fn last_triggered_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_triggered.map(|(_, at)| at)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

impl Default for RateState {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}
