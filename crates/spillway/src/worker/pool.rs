//! Elastic worker pool
//!
//! Owns a set of queue-polling workers that consume one shared bounded queue,
//! keeps `min_workers <= active <= max_workers`, and exposes backpressure-aware
//! offer, flush and shutdown.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::lifecycle::{StopSignal, WorkError, WorkUnit, Worker, WorkerError, WorkerState};
use super::poller::{ItemHandler, PollerConfig, PollerShared, QueuePoller};
use super::queue::BoundedQueue;
use super::scaling::{
    BacklogPolicy, FixedPolicy, PoolObservation, ScaleDecision, ScalingConfig, ScalingPolicy,
};
use crate::config::duration_millis;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name, used as the worker group in diagnostics
    pub name: String,

    /// Prefix for worker names (`{prefix}-{seq}`)
    pub worker_name_prefix: String,

    /// Workers started up front and never scaled below
    pub min_workers: usize,

    /// Upper bound for elastic growth
    pub max_workers: usize,

    /// Shared queue capacity
    pub queue_capacity: usize,

    /// Poller configuration applied to every worker
    pub poller: PollerConfig,

    /// Elastic scaling configuration
    pub scaling: ScalingConfig,

    /// Bound on waiting for each worker to exit
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: format!("pool-{}", Uuid::now_v7()),
            worker_name_prefix: "worker".to_string(),
            min_workers: 1,
            max_workers: 4,
            queue_capacity: 1024,
            poller: PollerConfig::default(),
            scaling: ScalingConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the worker name prefix
    pub fn with_worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    /// Set worker bounds
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Set queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set scaling configuration
    pub fn with_scaling(mut self, config: ScalingConfig) -> Self {
        self.scaling = config;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Whether the pool may change size at runtime
    pub fn is_elastic(&self) -> bool {
        self.max_workers > self.min_workers
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "min_workers must be at least 1".into(),
            ));
        }
        if self.max_workers < self.min_workers {
            return Err(PoolError::InvalidConfig(
                "max_workers must not be less than min_workers".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "queue_capacity must be positive".into(),
            ));
        }
        if self.queue_capacity > BoundedQueue::<()>::MAX_CAPACITY {
            return Err(PoolError::InvalidConfig(format!(
                "queue_capacity must not exceed {}",
                BoundedQueue::<()>::MAX_CAPACITY
            )));
        }
        self.poller.validate().map_err(PoolError::InvalidConfig)?;
        if self.is_elastic() {
            self.scaling.validate().map_err(PoolError::InvalidConfig)?;
        }
        Ok(())
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Constructed, not yet started
    Created,
    /// Accepting offers
    Running,
    /// Shutting down, no longer accepting offers
    Draining,
    /// All workers stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Invalid configuration
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// `start()` called twice or after shutdown
    #[error("worker pool {0} was already started")]
    AlreadyStarted(String),

    /// Worker factory could not create a handler
    #[error("worker factory failed: {0}")]
    Factory(#[source] anyhow::Error),

    /// Worker lifecycle error
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Some workers did not exit within the shutdown timeout
    #[error("{stragglers} worker(s) did not stop within the shutdown timeout")]
    ShutdownTimeout { stragglers: usize },

    /// A concurrent shutdown was still draining when the wait ran out
    #[error("worker pool {0} is still draining")]
    StillDraining(String),
}

/// Creates, validates and destroys the per-worker handlers of a pool
pub trait WorkerFactory<T>: Send + Sync + 'static {
    /// Build the handler for a new worker
    fn create(&self, worker_name: &str) -> anyhow::Result<ItemHandler<T>>;

    /// Whether a member is still fit to keep; unfit members are replaced
    fn validate(&self, member: &PoolMember) -> bool {
        member.state() == WorkerState::Running
    }

    /// Release resources of a member leaving the pool
    fn destroy(&self, _member: &PoolMember) {}
}

/// Factory that hands every worker the same handler
pub struct HandlerFactory<T> {
    handler: ItemHandler<T>,
}

impl<T> HandlerFactory<T> {
    pub fn new(handler: ItemHandler<T>) -> Self {
        Self { handler }
    }
}

impl<T: Send + 'static> WorkerFactory<T> for HandlerFactory<T> {
    fn create(&self, _worker_name: &str) -> anyhow::Result<ItemHandler<T>> {
        Ok(Arc::clone(&self.handler))
    }
}

/// A worker plus its pool bookkeeping
#[derive(Debug)]
pub struct PoolMember {
    worker: Worker,
    borrowed_at: DateTime<Utc>,
    returned_at: Mutex<Option<DateTime<Utc>>>,
    processed: Arc<AtomicU64>,
}

impl PoolMember {
    pub fn name(&self) -> &str {
        self.worker.name()
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    /// When the member joined the pool
    pub fn borrowed_at(&self) -> DateTime<Utc> {
        self.borrowed_at
    }

    /// When the member left the pool, if it has
    pub fn returned_at(&self) -> Option<DateTime<Utc>> {
        *self.returned_at.lock()
    }

    /// Items this member processed successfully
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub status: PoolStatus,
    pub active_workers: usize,
    pub queued: usize,
    pub capacity: usize,
    pub offered: u64,
    pub rejected: u64,
    pub processed: u64,
    pub failed: u64,
    pub discarded: u64,
}

struct PoolInner<T> {
    config: PoolConfig,
    queue: Arc<BoundedQueue<T>>,
    factory: Arc<dyn WorkerFactory<T>>,
    members: Mutex<Vec<Arc<PoolMember>>>,
    status: watch::Sender<PoolStatus>,
    shared: Arc<PollerShared>,
    offered: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
    next_seq: AtomicUsize,
}

impl<T: Send + 'static> PoolInner<T> {
    fn status(&self) -> PoolStatus {
        *self.status.borrow()
    }

    fn active_count(&self) -> usize {
        self.members.lock().len()
    }

    fn spawn_member(&self) -> Result<(), PoolError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.config.worker_name_prefix, seq);
        let handler = self.factory.create(&name).map_err(PoolError::Factory)?;

        let poller = QueuePoller::new(
            name.clone(),
            Arc::clone(&self.queue),
            handler,
            self.config.poller.clone(),
            Arc::clone(&self.shared),
        );
        let processed = poller.processed_counter();

        let worker = Worker::new(name.clone(), self.config.name.clone());
        worker.start(poller)?;

        self.members.lock().push(Arc::new(PoolMember {
            worker,
            borrowed_at: Utc::now(),
            returned_at: Mutex::new(None),
            processed,
        }));
        debug!(pool = %self.config.name, worker = %name, "Worker added");
        Ok(())
    }

    /// Stop a member that is already out of the active set
    ///
    /// Returns whether it stopped within the shutdown timeout.
    async fn retire(&self, member: Arc<PoolMember>) -> bool {
        let stopped = member
            .worker
            .shutdown(self.config.shutdown_timeout)
            .await
            .is_ok();
        *member.returned_at.lock() = Some(Utc::now());
        self.factory.destroy(&member);
        debug!(
            pool = %self.config.name,
            worker = %member.name(),
            processed = member.processed(),
            stopped,
            "Worker removed"
        );
        stopped
    }

    fn grow(&self, n: usize) -> Result<usize, PoolError> {
        let mut added = 0;
        while added < n && self.active_count() < self.config.max_workers {
            self.spawn_member()?;
            added += 1;
        }
        Ok(added)
    }

    async fn shrink(&self, n: usize) -> usize {
        let victims = {
            let mut members = self.members.lock();
            let keep = members
                .len()
                .saturating_sub(n)
                .max(self.config.min_workers);
            if keep >= members.len() {
                return 0;
            }
            let victims = members.split_off(keep);
            // Out of the active set first, then stopped
            for victim in &victims {
                victim.worker.request_stop();
            }
            victims
        };

        let removed = victims.len();
        for victim in victims {
            self.retire(victim).await;
        }
        removed
    }

    async fn replace_unhealthy(&self) -> Result<usize, PoolError> {
        let unhealthy: Vec<Arc<PoolMember>> = {
            let mut members = self.members.lock();
            let (unhealthy, healthy): (Vec<_>, Vec<_>) = members
                .drain(..)
                .partition(|member| !self.factory.validate(member));
            *members = healthy;
            unhealthy
        };

        for member in &unhealthy {
            warn!(
                pool = %self.config.name,
                worker = %member.name(),
                state = %member.state(),
                "Replacing unhealthy worker"
            );
            self.retire(Arc::clone(member)).await;
        }

        let mut spawned = 0;
        while self.active_count() < self.config.min_workers {
            self.spawn_member()?;
            spawned += 1;
        }
        Ok(spawned)
    }

    fn observe(&self) -> PoolObservation {
        PoolObservation {
            active_workers: self.active_count(),
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            queued: self.queue.len(),
            capacity: self.queue.capacity(),
            at: Instant::now(),
        }
    }
}

/// Work unit that applies the scaling policy on an interval
struct ScalerUnit<T> {
    inner: Arc<PoolInner<T>>,
    policy: Box<dyn ScalingPolicy>,
    interval: Duration,
}

#[async_trait]
impl<T: Send + 'static> WorkUnit for ScalerUnit<T> {
    async fn run_once(&mut self, stop: &mut StopSignal) -> Result<(), WorkError> {
        if stop.sleep(self.interval).await {
            return Ok(());
        }
        if self.inner.status() != PoolStatus::Running {
            return Ok(());
        }

        self.inner
            .replace_unhealthy()
            .await
            .map_err(|e| WorkError::recoverable(e.to_string()))?;

        let observation = self.inner.observe();
        match self.policy.evaluate(&observation) {
            ScaleDecision::Hold => {}
            ScaleDecision::Grow(n) => {
                let added = self
                    .inner
                    .grow(n)
                    .map_err(|e| WorkError::recoverable(e.to_string()))?;
                info!(
                    pool = %self.inner.config.name,
                    policy = self.policy.name(),
                    added,
                    queued = observation.queued,
                    active = self.inner.active_count(),
                    "Pool grown"
                );
            }
            ScaleDecision::Shrink(n) => {
                let removed = self.inner.shrink(n).await;
                info!(
                    pool = %self.inner.config.name,
                    policy = self.policy.name(),
                    removed,
                    active = self.inner.active_count(),
                    "Pool shrunk"
                );
            }
        }
        Ok(())
    }
}

/// Elastic pool of queue-polling workers
///
/// # Example
///
/// ```ignore
/// use spillway::worker::{item_handler, ElasticPool, PoolConfig};
///
/// let config = PoolConfig::new("orders").with_workers(2, 8);
/// let pool = ElasticPool::with_handler(
///     config,
///     item_handler(|order: Order| async move { process(order).await }),
/// )?;
///
/// pool.start().await?;
/// if !pool.offer(order, Duration::from_millis(50)).await {
///     // backpressure: shed or retry later
/// }
/// pool.shutdown(true).await?;
/// ```
pub struct ElasticPool<T> {
    inner: Arc<PoolInner<T>>,
    policy: Mutex<Option<Box<dyn ScalingPolicy>>>,
    scaler: Worker,
}

impl<T: Send + 'static> ElasticPool<T> {
    /// Create a pool whose workers are built by `factory`
    pub fn new(config: PoolConfig, factory: impl WorkerFactory<T>) -> Result<Self, PoolError> {
        config.validate()?;

        let policy: Box<dyn ScalingPolicy> = if config.is_elastic() {
            Box::new(BacklogPolicy::new(config.scaling.clone()))
        } else {
            Box::new(FixedPolicy)
        };
        let scaler = Worker::new(format!("{}-scaler", config.name), config.name.clone());

        let inner = PoolInner {
            queue: Arc::new(BoundedQueue::new(config.queue_capacity)),
            factory: Arc::new(factory),
            members: Mutex::new(Vec::with_capacity(config.max_workers)),
            status: watch::channel(PoolStatus::Created).0,
            shared: Arc::new(PollerShared::new()),
            offered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            next_seq: AtomicUsize::new(0),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
            policy: Mutex::new(Some(policy)),
            scaler,
        })
    }

    /// Create a pool where every worker shares one handler
    pub fn with_handler(config: PoolConfig, handler: ItemHandler<T>) -> Result<Self, PoolError> {
        Self::new(config, HandlerFactory::new(handler))
    }

    /// Replace the scaling policy (before `start`)
    pub fn with_policy(self, policy: impl ScalingPolicy) -> Self {
        *self.policy.lock() = Some(Box::new(policy));
        self
    }

    /// Start `min_workers` workers and the scaler
    #[instrument(skip(self), fields(pool = %self.inner.config.name))]
    pub async fn start(&self) -> Result<(), PoolError> {
        let started = self.inner.status.send_if_modified(|status| {
            if *status == PoolStatus::Created {
                *status = PoolStatus::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(PoolError::AlreadyStarted(self.inner.config.name.clone()));
        }

        let config = &self.inner.config;
        info!(
            pool = %config.name,
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            queue_capacity = config.queue_capacity,
            "Starting worker pool"
        );

        for _ in 0..config.min_workers {
            if let Err(e) = self.inner.spawn_member() {
                warn!(pool = %config.name, error = %e, "Failed to start worker, aborting pool start");
                self.shutdown(false).await.ok();
                return Err(e);
            }
        }

        let policy = self
            .policy
            .lock()
            .take()
            .unwrap_or_else(|| Box::new(FixedPolicy));
        self.scaler.start(ScalerUnit {
            inner: Arc::clone(&self.inner),
            policy,
            interval: config.scaling.evaluate_interval,
        })?;

        Ok(())
    }

    /// Try to enqueue `item` within `timeout`
    ///
    /// Returns `false` when the queue stays full for the whole timeout or the
    /// pool is not running. Never blocks past `timeout`; a zero timeout
    /// answers immediately.
    pub async fn offer(&self, item: T, timeout: Duration) -> bool {
        let status = self.inner.status();
        if status != PoolStatus::Running {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %self.inner.config.name, ?status, "Offer refused, pool not running");
            return false;
        }

        match self.inner.queue.offer(item, timeout).await {
            Ok(()) => {
                self.inner.offered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                if self.inner.shared.debug.load(Ordering::Relaxed) {
                    debug!(
                        pool = %self.inner.config.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "Offer timed out, queue full"
                    );
                }
                false
            }
        }
    }

    /// Whether at least one worker is running
    pub fn is_alive(&self) -> bool {
        self.inner
            .members
            .lock()
            .iter()
            .any(|member| member.state() == WorkerState::Running)
    }

    /// Wake idle workers so outstanding items are picked up promptly
    ///
    /// Best effort: the queue is not guaranteed to be empty on return.
    pub fn flush(&self) {
        debug!(
            pool = %self.inner.config.name,
            queued = self.inner.queue.len(),
            "Flush requested"
        );
        self.inner.shared.wake.notify_waiters();
    }

    /// Toggle per-item debug logging
    pub fn set_debug(&self, debug: bool) {
        self.inner.shared.debug.store(debug, Ordering::Relaxed);
    }

    /// Whether per-item debug logging is on
    pub fn is_debug(&self) -> bool {
        self.inner.shared.debug.load(Ordering::Relaxed)
    }

    /// Stop all workers
    ///
    /// With `graceful`, workers drain the queue before stopping; otherwise
    /// unconsumed items are discarded. Items a worker has already dequeued are
    /// always finished, bounded by the shutdown timeout. A call that finds a
    /// shutdown already in progress waits, up to the shutdown timeout, for the
    /// pool to reach `Stopped`.
    #[instrument(skip(self), fields(pool = %self.inner.config.name))]
    pub async fn shutdown(&self, graceful: bool) -> Result<(), PoolError> {
        let mut previous = PoolStatus::Stopped;
        self.inner.status.send_if_modified(|status| {
            previous = *status;
            match *status {
                PoolStatus::Created => {
                    *status = PoolStatus::Stopped;
                    true
                }
                PoolStatus::Running => {
                    *status = PoolStatus::Draining;
                    true
                }
                PoolStatus::Draining | PoolStatus::Stopped => false,
            }
        });

        match previous {
            PoolStatus::Stopped => return Ok(()),
            PoolStatus::Draining => return self.wait_until_stopped().await,
            PoolStatus::Created => {
                self.scaler.request_stop();
                self.inner.queue.close_and_clear();
                return Ok(());
            }
            PoolStatus::Running => {}
        }

        let config = &self.inner.config;
        info!(
            pool = %config.name,
            graceful,
            queued = self.inner.queue.len(),
            "Shutting down worker pool"
        );

        if let Err(e) = self.scaler.shutdown(config.shutdown_timeout).await {
            warn!(pool = %config.name, error = %e, "Scaler did not stop cleanly");
        }

        self.inner.queue.seal();
        self.inner
            .shared
            .drain_on_stop
            .store(graceful, Ordering::SeqCst);

        if !graceful {
            let discarded = self.inner.queue.close_and_clear();
            if discarded > 0 {
                self.inner
                    .discarded
                    .fetch_add(discarded as u64, Ordering::Relaxed);
                warn!(pool = %config.name, discarded, "Discarded unconsumed items");
            }
        }

        let members = std::mem::take(&mut *self.inner.members.lock());
        for member in &members {
            member.worker.request_stop();
        }
        let results = futures::future::join_all(
            members
                .iter()
                .map(|member| self.inner.retire(Arc::clone(member))),
        )
        .await;
        let stragglers = results.iter().filter(|stopped| !**stopped).count();

        let leftover = self.inner.queue.close_and_clear();
        if leftover > 0 {
            self.inner
                .discarded
                .fetch_add(leftover as u64, Ordering::Relaxed);
            warn!(pool = %config.name, leftover, "Items left in queue after shutdown");
        }

        self.inner.status.send_replace(PoolStatus::Stopped);
        info!(
            pool = %config.name,
            processed = self.inner.shared.processed(),
            stragglers,
            "Worker pool stopped"
        );

        if stragglers > 0 {
            Err(PoolError::ShutdownTimeout { stragglers })
        } else {
            Ok(())
        }
    }

    async fn wait_until_stopped(&self) -> Result<(), PoolError> {
        let mut status_rx = self.inner.status.subscribe();
        let stopped = tokio::time::timeout(
            self.inner.config.shutdown_timeout,
            status_rx.wait_for(|status| *status == PoolStatus::Stopped),
        )
        .await
        .is_ok();

        if stopped {
            Ok(())
        } else {
            warn!(pool = %self.inner.config.name, "Concurrent shutdown did not finish in time");
            Err(PoolError::StillDraining(self.inner.config.name.clone()))
        }
    }

    /// Get current status
    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// Number of workers in the active set
    pub fn active_count(&self) -> usize {
        self.inner.active_count()
    }

    /// Snapshot of the active members
    pub fn members(&self) -> Vec<Arc<PoolMember>> {
        self.inner.members.lock().clone()
    }

    /// Items currently queued
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Get the pool name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.inner.config.name.clone(),
            status: self.inner.status(),
            active_workers: self.inner.active_count(),
            queued: self.inner.queue.len(),
            capacity: self.inner.queue.capacity(),
            offered: self.inner.offered.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            processed: self.inner.shared.processed(),
            failed: self.inner.shared.failed(),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }
}
