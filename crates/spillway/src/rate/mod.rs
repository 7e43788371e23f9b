//! Rate counting, limiting and control
//!
//! - [`SecondCounter`] - Lock-free sliding per-second counter
//! - [`RateController`] - Rolling one-second cap in front of a [`TimedCall`]
//! - [`PermitLimiter`] - Token bucket with bounded waits
//! - [`RateState`] - Enabled switch plus throttled trigger

mod controller;
mod counter;
mod limiter;
mod state;

pub use controller::{RateControlConfig, RateControlStats, RateController, TimedCall};
pub use counter::{SecondCounter, WindowStats};
pub use limiter::PermitLimiter;
pub use state::RateState;
