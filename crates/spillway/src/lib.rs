//! # Spillway
//!
//! Backpressure-aware work hand-off for async services: elastic worker pools,
//! per-second rate control, and buffered telemetry persistence. No operation
//! blocks without a bound.
//!
//! ## Features
//!
//! - **Elastic pools**: queue-polling workers between `min` and `max`, with
//!   timed `offer` as the backpressure signal and graceful or immediate shutdown
//! - **Rate control**: an exact cap on calls in any rolling second in front of
//!   any timed call, with per-second history kept in a lock-free counter
//! - **Telemetry sink**: rate-limited bounded buffer with a watchdog-bounded
//!   flush worker that shuts the sink down instead of buffering into the void
//! - **Closed error taxonomy**: callers match on [`Error`] variants instead of
//!   parsing messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          ElasticPool            │        TelemetrySink       │
//! │  offer ─► BoundedQueue          │  offer ─► PermitLimiter    │
//! │            │                    │            │               │
//! │     QueuePoller × k             │     BoundedQueue           │
//! │   (Worker + WorkUnit)           │            │               │
//! │                                 │   FlushUnit ─► Writer      │
//! ├─────────────────────────────────┴────────────────────────────┤
//! │ RateController: admission log + SecondCounter (stats only)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use spillway::prelude::*;
//!
//! let pool = ElasticPool::with_handler(
//!     PoolConfig::new("events").with_workers(2, 8),
//!     item_handler(|event: Event| async move { index(event).await }),
//! )?;
//! pool.start().await?;
//!
//! if !pool.offer(event, Duration::from_millis(20)).await {
//!     metrics.shed();
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod rate;
pub mod telemetry;
pub mod worker;

pub use config::{ConfigError, SpillwayConfig};
pub use error::{Error, ErrorKind, Result};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, SpillwayConfig};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::rate::{
        PermitLimiter, RateControlConfig, RateController, RateState, SecondCounter, TimedCall,
        WindowStats,
    };
    pub use crate::telemetry::{
        Alerter, LineFileWriter, LogAlerter, MemoryWriter, SinkConfig, SinkStatus, TelemetrySink,
        TelemetryWriter,
    };
    pub use crate::worker::{
        item_handler, ElasticPool, HandlerFactory, PollerConfig, PoolConfig, PoolError,
        PoolStatus, ScalingConfig, ScalingPolicy, StopSignal, WorkError, WorkUnit, Worker,
        WorkerFactory, WorkerState,
    };
}
