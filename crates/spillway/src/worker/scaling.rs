//! Elastic scaling policies for worker pools
//!
//! A [`ScalingPolicy`] looks at a [`PoolObservation`] and recommends growing,
//! shrinking or holding. The pool applies the decision within its
//! `min..=max` bounds.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// Scaling configuration
///
/// Uses high/low backlog watermarks with hysteresis: the pool grows only
/// after the backlog has stayed above the high watermark for `grow_after`,
/// and shrinks only after it has stayed below the low watermark for
/// `shrink_after`.
///
/// # Example
///
/// ```
/// use spillway::worker::ScalingConfig;
/// use std::time::Duration;
///
/// let config = ScalingConfig::default()
///     .with_high_watermark(0.5)
///     .with_low_watermark(0.05)
///     .with_grow_after(Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalingConfig {
    /// How often the policy is evaluated
    #[serde(with = "duration_millis")]
    pub evaluate_interval: Duration,

    /// Backlog ratio (queued / capacity) at or above which the pool is under pressure
    pub high_watermark: f64,

    /// Backlog ratio at or below which the pool is considered idle
    pub low_watermark: f64,

    /// Sustained pressure required before adding workers
    #[serde(with = "duration_millis")]
    pub grow_after: Duration,

    /// Sustained idleness required before removing workers
    #[serde(with = "duration_millis")]
    pub shrink_after: Duration,

    /// Workers added or removed per decision
    pub step: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            evaluate_interval: Duration::from_millis(500),
            high_watermark: 0.5,
            low_watermark: 0.0,
            grow_after: Duration::from_secs(2),
            shrink_after: Duration::from_secs(30),
            step: 1,
        }
    }
}

impl ScalingConfig {
    /// Create a new scaling configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the evaluation interval
    pub fn with_evaluate_interval(mut self, interval: Duration) -> Self {
        self.evaluate_interval = interval;
        self
    }

    /// Set the high watermark (when to consider growing)
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Set the low watermark (when to consider shrinking)
    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Set how long pressure must last before growing
    pub fn with_grow_after(mut self, duration: Duration) -> Self {
        self.grow_after = duration;
        self
    }

    /// Set how long idleness must last before shrinking
    pub fn with_shrink_after(mut self, duration: Duration) -> Self {
        self.shrink_after = duration;
        self
    }

    /// Set the step size
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step.max(1);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.low_watermark >= self.high_watermark {
            return Err("low_watermark must be less than high_watermark".into());
        }
        if self.evaluate_interval.is_zero() {
            return Err("evaluate_interval must be positive".into());
        }
        Ok(())
    }
}

/// Snapshot of pool load handed to a policy
#[derive(Debug, Clone, Copy)]
pub struct PoolObservation {
    pub active_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub queued: usize,
    pub capacity: usize,
    pub at: Instant,
}

impl PoolObservation {
    /// Queued items relative to queue capacity
    pub fn backlog_ratio(&self) -> f64 {
        self.queued as f64 / self.capacity.max(1) as f64
    }

    /// Workers that could still be added
    pub fn headroom(&self) -> usize {
        self.max_workers.saturating_sub(self.active_workers)
    }

    /// Workers that could still be removed
    pub fn surplus(&self) -> usize {
        self.active_workers.saturating_sub(self.min_workers)
    }
}

/// Scaling recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    Grow(usize),
    Shrink(usize),
}

/// Pluggable growth/shrink policy
pub trait ScalingPolicy: Send + 'static {
    /// Recommend an action for the observed load
    fn evaluate(&mut self, observation: &PoolObservation) -> ScaleDecision;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Never scales; the pool stays at its minimum size
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedPolicy;

impl ScalingPolicy for FixedPolicy {
    fn evaluate(&mut self, _observation: &PoolObservation) -> ScaleDecision {
        ScaleDecision::Hold
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Grows on sustained backlog, shrinks on sustained idleness
#[derive(Debug, Clone)]
pub struct BacklogPolicy {
    config: ScalingConfig,
    pressure_since: Option<Instant>,
    idle_since: Option<Instant>,
}

impl BacklogPolicy {
    pub fn new(config: ScalingConfig) -> Self {
        Self {
            config,
            pressure_since: None,
            idle_since: None,
        }
    }
}

impl ScalingPolicy for BacklogPolicy {
    fn evaluate(&mut self, obs: &PoolObservation) -> ScaleDecision {
        let ratio = obs.backlog_ratio();

        if ratio >= self.config.high_watermark {
            self.idle_since = None;
            let since = *self.pressure_since.get_or_insert(obs.at);
            if obs.at.duration_since(since) >= self.config.grow_after {
                let n = self.config.step.min(obs.headroom());
                if n > 0 {
                    // Require another sustained period before the next step
                    self.pressure_since = Some(obs.at);
                    return ScaleDecision::Grow(n);
                }
            }
            return ScaleDecision::Hold;
        }

        self.pressure_since = None;

        if ratio <= self.config.low_watermark {
            let since = *self.idle_since.get_or_insert(obs.at);
            if obs.at.duration_since(since) >= self.config.shrink_after {
                let n = self.config.step.min(obs.surplus());
                if n > 0 {
                    self.idle_since = Some(obs.at);
                    return ScaleDecision::Shrink(n);
                }
            }
        } else {
            // Between the watermarks: hold and restart both timers
            self.idle_since = None;
        }

        ScaleDecision::Hold
    }

    fn name(&self) -> &'static str {
        "backlog"
    }
}
