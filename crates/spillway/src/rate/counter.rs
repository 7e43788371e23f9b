//! Second-based rate counter
//!
//! A circular window of per-second buckets. Each bucket packs the epoch
//! second it belongs to (high 32 bits) and its count (low 32 bits) into one
//! `AtomicU64`, so "reset if stale, then add" is a single compare-and-swap:
//! writers racing across a second boundary never lose counts or reset twice,
//! and readers never block writers.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;

const COUNT_BITS: u32 = 32;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

#[inline]
fn pack(second: u32, count: u32) -> u64 {
    (u64::from(second) << COUNT_BITS) | u64::from(count)
}

#[inline]
fn unpack(value: u64) -> (u32, u32) {
    ((value >> COUNT_BITS) as u32, (value & COUNT_MASK) as u32)
}

/// Current second of the Unix epoch
pub(crate) fn epoch_seconds() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// Snapshot of the trailing window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    /// Count per second, oldest first; stale seconds read as zero
    pub counts: Vec<u32>,
    /// Sum of `counts`
    pub total: u64,
    /// Epoch second of the newest bucket
    pub ending_at: u64,
}

impl WindowStats {
    /// Average events per second over the snapshot
    pub fn mean_per_second(&self) -> f64 {
        if self.counts.is_empty() {
            0.0
        } else {
            self.total as f64 / self.counts.len() as f64
        }
    }

    /// Busiest second in the snapshot
    pub fn peak(&self) -> u32 {
        self.counts.iter().copied().max().unwrap_or(0)
    }
}

/// Sliding per-second activity counter
#[derive(Debug)]
pub struct SecondCounter {
    buckets: Box<[AtomicU64]>,
}

impl SecondCounter {
    /// Create a counter remembering the last `window_seconds` seconds (minimum 1)
    pub fn new(window_seconds: usize) -> Self {
        let len = window_seconds.max(1);
        Self {
            buckets: (0..len).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Window length in seconds
    pub fn window_seconds(&self) -> usize {
        self.buckets.len()
    }

    /// Slot of the current second: `epoch_seconds mod window`
    ///
    /// Repeats every window; only meaningful relative to the last observed value.
    pub fn current_second_id(&self) -> usize {
        self.slot(epoch_seconds())
    }

    /// Count one event in the current second and return that second's count
    pub fn increment(&self) -> u32 {
        self.increment_at(epoch_seconds()).unwrap_or(0)
    }

    /// Count one event in `second`
    ///
    /// Returns `None` if the bucket already belongs to a newer second; the
    /// late event is dropped rather than credited to the wrong second.
    pub fn increment_at(&self, second: u64) -> Option<u32> {
        self.update(second, u32::MAX).ok()
    }

    /// Count one event in the current second only if fewer than `cap` were
    /// counted so far
    ///
    /// Returns the new count on success, the count that blocked it otherwise.
    pub fn try_increment_below(&self, cap: u32) -> Result<u32, u32> {
        self.try_increment_below_at(epoch_seconds(), cap)
    }

    /// [`try_increment_below`](Self::try_increment_below) for an explicit second
    pub fn try_increment_below_at(&self, second: u64, cap: u32) -> Result<u32, u32> {
        self.update(second, cap)
    }

    /// Count recorded for `second`, zero if its bucket is stale
    pub fn count_at(&self, second: u64) -> u32 {
        let (stamp, count) = unpack(self.buckets[self.slot(second)].load(Ordering::Acquire));
        if stamp == second as u32 {
            count
        } else {
            0
        }
    }

    /// Snapshot of the trailing `seconds` seconds ending now
    pub fn window_stats(&self, seconds: usize) -> WindowStats {
        self.window_stats_at(epoch_seconds(), seconds)
    }

    /// Snapshot of the trailing `seconds` seconds ending at `second`
    ///
    /// `seconds` is clamped to the window length.
    pub fn window_stats_at(&self, second: u64, seconds: usize) -> WindowStats {
        let n = seconds.clamp(1, self.buckets.len()) as u64;
        let counts: Vec<u32> = (0..n)
            .rev()
            .map(|back| second.checked_sub(back).map_or(0, |s| self.count_at(s)))
            .collect();
        let total = counts.iter().map(|&c| u64::from(c)).sum();
        WindowStats {
            counts,
            total,
            ending_at: second,
        }
    }

    fn slot(&self, second: u64) -> usize {
        (second % self.buckets.len() as u64) as usize
    }

    fn update(&self, second: u64, cap: u32) -> Result<u32, u32> {
        let stamp = second as u32;
        let bucket = &self.buckets[self.slot(second)];
        let mut current = bucket.load(Ordering::Acquire);
        loop {
            let (bucket_second, count) = unpack(current);
            let count = match bucket_second.cmp(&stamp) {
                std::cmp::Ordering::Equal => count,
                std::cmp::Ordering::Less => 0,
                std::cmp::Ordering::Greater => return Err(0),
            };
            if count >= cap {
                return Err(count);
            }
            let next = count + 1;
            match bucket.compare_exchange_weak(
                current,
                pack(stamp, next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for SecondCounter {
    fn default() -> Self {
        Self::new(60)
    }
}
