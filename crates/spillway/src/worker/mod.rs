//! Workers and elastic worker pools
//!
//! This module provides:
//! - [`Worker`] - Long-running background loop with a start/stop lifecycle
//! - [`BoundedQueue`] - Bounded MPMC queue with timed offer/poll
//! - [`QueuePoller`] - Work unit that consumes a queue with idle backoff
//! - [`ElasticPool`] - Pool of pollers with elastic sizing and backpressure
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ElasticPool                            │
//! │                                                               │
//! │   offer(item, timeout)                                        │
//! │         │                                                     │
//! │         ▼                                                     │
//! │  ┌──────────────────────────────────────────────────────┐     │
//! │  │             BoundedQueue (capacity N)                 │     │
//! │  └──────┬───────────────┬───────────────┬───────────────┘     │
//! │         ▼               ▼               ▼                     │
//! │  [QueuePoller 0] [QueuePoller 1] ... [QueuePoller k]          │
//! │   min_workers <= k + 1 <= max_workers                         │
//! │                                                               │
//! │  ┌──────────────────────────────────────────────────────┐     │
//! │  │  Scaler (ScalingPolicy, replaces unhealthy workers)  │     │
//! │  └──────────────────────────────────────────────────────┘     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use spillway::worker::{item_handler, ElasticPool, PoolConfig};
//!
//! let pool = ElasticPool::with_handler(
//!     PoolConfig::new("events").with_workers(1, 4),
//!     item_handler(|event: Event| async move { store(event).await }),
//! )?;
//!
//! pool.start().await?;
//! pool.offer(event, Duration::from_millis(10)).await;
//! pool.shutdown(true).await?;
//! ```

mod lifecycle;
mod poller;
mod pool;
mod queue;
mod scaling;

pub use lifecycle::{
    ExitReason, StopSignal, WorkError, WorkUnit, Worker, WorkerError, WorkerState,
};
pub use poller::{
    item_handler, HandlerResult, ItemHandler, PollerConfig, PollerShared, QueuePoller,
};
pub use pool::{
    ElasticPool, HandlerFactory, PoolConfig, PoolError, PoolMember, PoolStats, PoolStatus,
    WorkerFactory,
};
pub use queue::BoundedQueue;
pub use scaling::{
    BacklogPolicy, FixedPolicy, PoolObservation, ScaleDecision, ScalingConfig, ScalingPolicy,
};
