//! Buffered telemetry sink
//!
//! Producers hand items to a bounded buffer through a permits-per-second
//! limiter. One flush worker drains the buffer on an interval (or when
//! signalled) and persists each batch through a [`TelemetryWriter`] under a
//! watchdog timeout. A flush that misses its deadline, fails, or appends fewer
//! items than it drained shuts the sink down instead of retrying.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use super::alert::{Alerter, LogAlerter};
use super::item::TelemetryItem;
use super::writer::{TelemetryWriter, WriteError};
use crate::config::duration_millis;
use crate::error::{Error, Result};
use crate::rate::{PermitLimiter, RateState};
use crate::worker::{BoundedQueue, ExitReason, StopSignal, WorkError, WorkUnit, Worker, WorkerError};

/// Telemetry sink configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SinkConfig {
    /// Sink name for diagnostics
    pub name: String,

    /// Buffer capacity
    pub capacity: usize,

    /// Producer permits granted per second
    pub permits_per_second: u32,

    /// Interval between scheduled flushes
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,

    /// Watchdog deadline for persisting one batch
    #[serde(with = "duration_millis")]
    pub write_timeout: Duration,

    /// Bound on waiting for the flush worker to exit
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Minimum spacing between operator alerts
    #[serde(with = "duration_millis")]
    pub alert_min_interval: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            name: "telemetry".to_string(),
            capacity: 10_000,
            permits_per_second: 1_000,
            flush_interval: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            alert_min_interval: Duration::from_secs(300),
        }
    }
}

impl SinkConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_permits_per_second(mut self, permits: u32) -> Self {
        self.permits_per_second = permits;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_alert_min_interval(mut self, interval: Duration) -> Self {
        self.alert_min_interval = interval;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.capacity == 0 {
            return Err("capacity must be positive".into());
        }
        if self.capacity > BoundedQueue::<()>::MAX_CAPACITY {
            return Err(format!(
                "capacity must not exceed {}",
                BoundedQueue::<()>::MAX_CAPACITY
            ));
        }
        if self.permits_per_second == 0 {
            return Err("permits_per_second must be positive".into());
        }
        if self.flush_interval.is_zero() {
            return Err("flush_interval must be positive".into());
        }
        if self.write_timeout.is_zero() {
            return Err("write_timeout must be positive".into());
        }
        if self.shutdown_timeout < self.write_timeout {
            return Err("shutdown_timeout must cover at least one write_timeout".into());
        }
        Ok(())
    }
}

/// Sink errors raised at construction
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("invalid sink configuration: {0}")]
    InvalidConfig(String),

    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Sink status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkStatus {
    Running,
    Disabled,
    ShutDown,
}

impl std::fmt::Display for SinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Disabled => write!(f, "disabled"),
            Self::ShutDown => write!(f, "shut_down"),
        }
    }
}

/// Point-in-time sink statistics
#[derive(Debug, Clone, Serialize)]
pub struct SinkStats {
    pub name: String,
    pub status: SinkStatus,
    /// Items accepted into the buffer
    pub offered: u64,
    /// Items refused or discarded without raising
    pub dropped: u64,
    /// Offers that raised
    pub rejected: u64,
    /// Items confirmed written
    pub written: u64,
    pub failed_flushes: u64,
    pub buffered: usize,
    /// When the most recent batch was confirmed written
    pub last_written_at: Option<DateTime<Utc>>,
    /// Longest time an item of the most recent batch spent buffered
    pub last_batch_max_latency_ms: Option<u64>,
    pub shutdown_reason: Option<String>,
}

struct SinkShared<T> {
    config: SinkConfig,
    buffer: BoundedQueue<TelemetryItem<T>>,
    limiter: PermitLimiter,
    switch: RateState,
    alerts: RateState,
    alerter: Arc<dyn Alerter>,
    shut_down: AtomicBool,
    shutdown_reason: Mutex<Option<String>>,
    flush_signal: Notify,
    offered: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    written: AtomicU64,
    failed_flushes: AtomicU64,
    last_batch: Mutex<Option<BatchReceipt>>,
}

#[derive(Debug, Clone, Copy)]
struct BatchReceipt {
    written_at: DateTime<Utc>,
    max_latency_ms: u64,
}

impl<T> SinkShared<T> {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Flip to shut down; true only for the caller that made the transition
    fn begin_shutdown(&self, reason: &str) -> bool {
        if self
            .shut_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *self.shutdown_reason.lock() = Some(reason.to_string());
        self.buffer.seal();
        true
    }

    fn refuse(&self, allow_drop: bool, reason: &str) -> Result<bool> {
        if allow_drop {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            Ok(false)
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            Err(Error::overloaded(format!(
                "telemetry sink {}: {reason}",
                self.config.name
            )))
        }
    }

    fn unavailable(&self, why: &str) -> Error {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        Error::unavailable(format!("telemetry sink {} is {why}", self.config.name))
    }

    async fn raise_alert(&self, reason: &str) {
        if !self.alerts.trigger() {
            debug!(sink = %self.config.name, "Alert suppressed by throttle");
            return;
        }
        let subject = format!("telemetry sink {} shut down", self.config.name);
        match tokio::time::timeout(
            self.config.write_timeout,
            self.alerter.alert(&subject, reason),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(sink = %self.config.name, error = %e, "Failed to send alert"),
            Err(_) => warn!(sink = %self.config.name, "Alert timed out"),
        }
    }
}

/// Bounded buffer plus one watchdog-bounded flush worker
///
/// # Example
///
/// ```ignore
/// use spillway::telemetry::{LineFileWriter, SinkConfig, TelemetrySink};
///
/// let writer = LineFileWriter::open("logs/requests.log").await?;
/// let sink = TelemetrySink::start(SinkConfig::new("requests"), writer)?;
///
/// // Shed load instead of raising when saturated
/// sink.offer_telemetry(record, Duration::from_millis(5), Duration::ZERO, true).await?;
///
/// sink.shut_down("deploy").await;
/// ```
pub struct TelemetrySink<T> {
    shared: Arc<SinkShared<T>>,
    worker: Worker,
}

impl<T: Serialize + Send + Sync + 'static> TelemetrySink<T> {
    /// Start a sink that alerts through the log
    pub fn start(
        config: SinkConfig,
        writer: impl TelemetryWriter,
    ) -> std::result::Result<Self, SinkError> {
        Self::start_with_alerter(config, writer, Arc::new(LogAlerter))
    }

    /// Start a sink with a custom alerter
    pub fn start_with_alerter(
        config: SinkConfig,
        writer: impl TelemetryWriter,
        alerter: Arc<dyn Alerter>,
    ) -> std::result::Result<Self, SinkError> {
        config.validate().map_err(SinkError::InvalidConfig)?;

        let shared = Arc::new(SinkShared {
            buffer: BoundedQueue::new(config.capacity),
            limiter: PermitLimiter::new(config.permits_per_second),
            switch: RateState::default(),
            alerts: RateState::new(config.alert_min_interval),
            alerter,
            shut_down: AtomicBool::new(false),
            shutdown_reason: Mutex::new(None),
            flush_signal: Notify::new(),
            offered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            written: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            last_batch: Mutex::new(None),
            config,
        });

        let worker = Worker::new(format!("{}-flush", shared.config.name), shared.config.name.clone());
        worker.start(FlushUnit {
            interval: shared.config.flush_interval,
            shared: Arc::clone(&shared),
            writer,
        })?;

        info!(
            sink = %shared.config.name,
            capacity = shared.config.capacity,
            permits_per_second = shared.config.permits_per_second,
            "Telemetry sink started"
        );
        Ok(Self { shared, worker })
    }

    /// Buffer `content` for the next flush
    ///
    /// Waits at most `permit_wait` for a rate permit, then at most
    /// `offer_wait` for a buffer slot. When either runs out, returns
    /// `Ok(false)` if `allow_drop`, otherwise raises [`Error::Overloaded`].
    /// Raises [`Error::Unavailable`] while disabled or shut down.
    pub async fn offer_telemetry(
        &self,
        content: T,
        permit_wait: Duration,
        offer_wait: Duration,
        allow_drop: bool,
    ) -> Result<bool> {
        let shared = &self.shared;
        if shared.is_shut_down() {
            return Err(shared.unavailable("shut down"));
        }
        if !shared.switch.is_enabled() {
            return Err(shared.unavailable("disabled"));
        }

        if !shared.limiter.acquire(permit_wait).await {
            return shared.refuse(allow_drop, "no rate permit available");
        }

        match shared.buffer.offer(TelemetryItem::new(content), offer_wait).await {
            Ok(()) => {
                shared.offered.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(_) if shared.buffer.is_sealed() => Err(shared.unavailable("shut down")),
            Err(_) => shared.refuse(allow_drop, "buffer full"),
        }
    }

    /// Accept offers again
    pub fn enable(&self) {
        self.shared.switch.enable();
        info!(sink = %self.shared.config.name, "Telemetry sink enabled");
    }

    /// Refuse offers; a flush in progress is not interrupted
    pub fn disable(&self) {
        self.shared.switch.disable();
        info!(sink = %self.shared.config.name, "Telemetry sink disabled");
    }

    /// Ask the flush worker to flush now
    pub fn flush(&self) {
        self.shared.flush_signal.notify_one();
    }

    /// Shut the sink down
    ///
    /// Idempotent. The first call stops the flush worker after one final
    /// bounded flush; later calls, and calls after a fatal flush failure,
    /// only wait for the worker to be gone. Returns whether this call
    /// initiated the shutdown.
    #[instrument(skip(self), fields(sink = %self.shared.config.name))]
    pub async fn shut_down(&self, reason: &str) -> bool {
        let initiated = self.shared.begin_shutdown(reason);
        if initiated {
            info!(sink = %self.shared.config.name, reason, "Shutting down telemetry sink");
        }
        if let Err(e) = self.worker.shutdown(self.shared.config.shutdown_timeout).await {
            warn!(sink = %self.shared.config.name, error = %e, "Flush worker did not stop in time");
        }
        initiated
    }

    pub fn status(&self) -> SinkStatus {
        if self.shared.is_shut_down() {
            SinkStatus::ShutDown
        } else if !self.shared.switch.is_enabled() {
            SinkStatus::Disabled
        } else {
            SinkStatus::Running
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    pub fn shutdown_reason(&self) -> Option<String> {
        self.shared.shutdown_reason.lock().clone()
    }

    /// Items waiting for the next flush
    pub fn buffered(&self) -> usize {
        self.shared.buffer.len()
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn stats(&self) -> SinkStats {
        let shared = &self.shared;
        let last_batch = *shared.last_batch.lock();
        SinkStats {
            name: shared.config.name.clone(),
            status: self.status(),
            offered: shared.offered.load(Ordering::Relaxed),
            dropped: shared.dropped.load(Ordering::Relaxed),
            rejected: shared.rejected.load(Ordering::Relaxed),
            written: shared.written.load(Ordering::Relaxed),
            failed_flushes: shared.failed_flushes.load(Ordering::Relaxed),
            buffered: shared.buffer.len(),
            last_written_at: last_batch.map(|receipt| receipt.written_at),
            last_batch_max_latency_ms: last_batch.map(|receipt| receipt.max_latency_ms),
            shutdown_reason: self.shutdown_reason(),
        }
    }
}

/// Append every item of `batch`, then flush the writer
///
/// Items that fail to encode are skipped, which surfaces as a count mismatch.
async fn persist<T: Serialize, W: TelemetryWriter>(
    writer: &mut W,
    batch: &[TelemetryItem<T>],
) -> std::result::Result<usize, (usize, WriteError)> {
    let mut appended = 0;
    for item in batch {
        let line = match serde_json::to_string(item) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Skipping telemetry item that failed to encode");
                continue;
            }
        };
        writer
            .append(&line)
            .await
            .map_err(|e| (appended, e))?;
        appended += 1;
    }
    writer.flush().await.map_err(|e| (appended, e))?;
    Ok(appended)
}

struct FlushUnit<T, W> {
    shared: Arc<SinkShared<T>>,
    writer: W,
    interval: Duration,
}

impl<T: Serialize + Send + Sync + 'static, W: TelemetryWriter> FlushUnit<T, W> {
    async fn flush_batch(&mut self) -> std::result::Result<(), WorkError> {
        let mut batch = self.shared.buffer.drain(usize::MAX);
        if batch.is_empty() {
            return Ok(());
        }
        let drained = batch.len();
        let deadline = self.shared.config.write_timeout;

        let outcome = tokio::time::timeout(deadline, persist(&mut self.writer, &batch)).await;
        let failure = match outcome {
            Ok(Ok(appended)) if appended == drained => {
                let now = Utc::now();
                let mut max_latency_ms = 0u64;
                for item in &mut batch {
                    item.mark_written(now);
                    if let Some(written_at) = item.written_at {
                        let latency = (written_at - item.created_at).num_milliseconds().max(0);
                        max_latency_ms = max_latency_ms.max(latency as u64);
                    }
                }
                *self.shared.last_batch.lock() = Some(BatchReceipt {
                    written_at: now,
                    max_latency_ms,
                });
                self.shared
                    .written
                    .fetch_add(drained as u64, Ordering::Relaxed);
                debug!(
                    sink = %self.shared.config.name,
                    count = drained,
                    max_latency_ms,
                    "Telemetry flushed"
                );
                return Ok(());
            }
            Ok(Ok(appended)) => format!("appended {appended} of {drained} items"),
            Ok(Err((appended, e))) => {
                format!("write failed after {appended} of {drained} items: {e}")
            }
            Err(_) => format!("write of {drained} items did not finish within {deadline:?}"),
        };

        self.shared.failed_flushes.fetch_add(1, Ordering::Relaxed);
        error!(
            sink = %self.shared.config.name,
            reason = %failure,
            "Telemetry flush failed, shutting sink down"
        );
        if self.shared.begin_shutdown(&failure) {
            self.shared.raise_alert(&failure).await;
        }
        Err(WorkError::fatal(failure))
    }
}

#[async_trait]
impl<T: Serialize + Send + Sync + 'static, W: TelemetryWriter> WorkUnit for FlushUnit<T, W> {
    async fn run_once(&mut self, stop: &mut StopSignal) -> std::result::Result<(), WorkError> {
        let shared = Arc::clone(&self.shared);
        tokio::select! {
            _ = tokio::time::sleep(self.interval) => {}
            _ = shared.flush_signal.notified() => {}
            _ = stop.stopped() => return Ok(()),
        }
        self.flush_batch().await
    }

    async fn on_shutdown(&mut self, reason: &ExitReason) {
        let name = self.shared.config.name.clone();
        if matches!(reason, ExitReason::StopRequested) {
            // Operator shutdown: one last bounded flush; failure is already logged
            let _ = self.flush_batch().await;
        }

        let discarded = self.shared.buffer.close_and_clear();
        if discarded > 0 {
            self.shared
                .dropped
                .fetch_add(discarded as u64, Ordering::Relaxed);
            warn!(sink = %name, discarded, "Discarded buffered telemetry on shutdown");
        }

        match tokio::time::timeout(self.shared.config.write_timeout, self.writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(sink = %name, error = %e, "Failed to close telemetry writer"),
            Err(_) => warn!(sink = %name, "Closing telemetry writer timed out"),
        }
        info!(sink = %name, "Telemetry sink stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemoryWriter;
    use serde_json::Value;

    #[derive(Default)]
    struct CountingAlerter {
        alerts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Alerter for CountingAlerter {
        async fn alert(&self, subject: &str, _body: &str) -> anyhow::Result<()> {
            self.alerts.lock().push(subject.to_string());
            Ok(())
        }
    }

    fn quiet_config() -> SinkConfig {
        // Long interval: nothing is flushed unless asked
        SinkConfig::new("test")
            .with_flush_interval(Duration::from_secs(60))
            .with_write_timeout(Duration::from_millis(200))
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    #[test]
    fn test_default_config() {
        let config = SinkConfig::default();
        assert_eq!(config.capacity, 10_000);
        assert_eq!(config.permits_per_second, 1_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(SinkConfig::default().with_capacity(0).validate().is_err());
        assert!(SinkConfig::default()
            .with_capacity(usize::MAX)
            .validate()
            .is_err());
        assert!(SinkConfig::default()
            .with_permits_per_second(0)
            .validate()
            .is_err());
        assert!(SinkConfig::default()
            .with_write_timeout(Duration::from_secs(30))
            .with_shutdown_timeout(Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_serializes_millis() {
        let json = serde_json::to_value(SinkConfig::default()).unwrap();
        assert_eq!(json["write_timeout"], 5000);
        assert_eq!(json["flush_interval"], 1000);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = TelemetrySink::<u32>::start(SinkConfig::default().with_capacity(0), MemoryWriter::new());
        assert!(matches!(result, Err(SinkError::InvalidConfig(_))));

        let result = TelemetrySink::<u32>::start(
            SinkConfig::default().with_capacity(usize::MAX),
            MemoryWriter::new(),
        );
        assert!(matches!(result, Err(SinkError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_flush_writes_json_lines() {
        let writer = MemoryWriter::new();
        let lines = writer.lines();
        let sink = TelemetrySink::start(quiet_config(), writer).unwrap();

        for n in 0..3u32 {
            assert!(sink
                .offer_telemetry(n, Duration::ZERO, Duration::ZERO, false)
                .await
                .unwrap());
        }
        sink.flush();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let lines = lines.lock().clone();
        assert_eq!(lines.len(), 3);
        let first: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first["content"], 0);
        assert!(first.get("created_at").is_some());
        let stats = sink.stats();
        assert_eq!(stats.written, 3);
        assert_eq!(sink.buffered(), 0);
        let written_at = stats.last_written_at.expect("batch receipt recorded");
        let created_at: DateTime<Utc> = first["created_at"].as_str().unwrap().parse().unwrap();
        assert!(written_at >= created_at);
        assert!(stats.last_batch_max_latency_ms.is_some());

        sink.shut_down("test").await;
    }

    #[tokio::test]
    async fn test_full_buffer_overloaded_or_dropped() {
        let sink = TelemetrySink::start(quiet_config().with_capacity(2), MemoryWriter::new()).unwrap();

        for n in 0..2u32 {
            sink.offer_telemetry(n, Duration::ZERO, Duration::ZERO, false)
                .await
                .unwrap();
        }
        let err = sink
            .offer_telemetry(2, Duration::ZERO, Duration::ZERO, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded(_)));

        let accepted = sink
            .offer_telemetry(3, Duration::ZERO, Duration::ZERO, true)
            .await
            .unwrap();
        assert!(!accepted);

        let stats = sink.stats();
        assert_eq!(stats.offered, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.dropped, 1);

        sink.shut_down("test").await;
    }

    #[tokio::test]
    async fn test_permit_exhaustion_overloaded_or_dropped() {
        let sink = TelemetrySink::start(quiet_config().with_permits_per_second(2), MemoryWriter::new())
            .unwrap();

        for n in 0..2u32 {
            sink.offer_telemetry(n, Duration::ZERO, Duration::ZERO, false)
                .await
                .unwrap();
        }
        assert!(matches!(
            sink.offer_telemetry(2, Duration::ZERO, Duration::ZERO, false)
                .await,
            Err(Error::Overloaded(_))
        ));
        assert!(!sink
            .offer_telemetry(3, Duration::ZERO, Duration::ZERO, true)
            .await
            .unwrap());

        sink.shut_down("test").await;
    }

    #[tokio::test]
    async fn test_disable_enable() {
        let sink = TelemetrySink::start(quiet_config(), MemoryWriter::new()).unwrap();

        sink.disable();
        assert_eq!(sink.status(), SinkStatus::Disabled);
        assert!(matches!(
            sink.offer_telemetry(1u32, Duration::ZERO, Duration::ZERO, true)
                .await,
            Err(Error::Unavailable(_))
        ));

        sink.enable();
        assert_eq!(sink.status(), SinkStatus::Running);
        assert!(sink
            .offer_telemetry(2u32, Duration::ZERO, Duration::ZERO, false)
            .await
            .unwrap());

        sink.shut_down("test").await;
    }

    #[tokio::test]
    async fn test_operator_shutdown_flushes_remaining_items() {
        let writer = MemoryWriter::new();
        let lines = writer.lines();
        let sink = TelemetrySink::start(quiet_config(), writer).unwrap();

        for n in 0..5u32 {
            sink.offer_telemetry(n, Duration::ZERO, Duration::ZERO, false)
                .await
                .unwrap();
        }
        assert!(sink.shut_down("deploy").await);

        assert_eq!(lines.lock().len(), 5);
        assert_eq!(sink.status(), SinkStatus::ShutDown);
        assert_eq!(sink.shutdown_reason().as_deref(), Some("deploy"));
        assert!(matches!(
            sink.offer_telemetry(9, Duration::ZERO, Duration::ZERO, true)
                .await,
            Err(Error::Unavailable(_))
        ));

        // Idempotent
        assert!(!sink.shut_down("again").await);
        assert_eq!(sink.shutdown_reason().as_deref(), Some("deploy"));
    }

    #[tokio::test]
    async fn test_watchdog_timeout_shuts_down_once_and_alerts() {
        let alerter = Arc::new(CountingAlerter::default());
        let writer = MemoryWriter::new().with_append_delay(Duration::from_secs(5));
        let lines = writer.lines();
        let config = quiet_config().with_write_timeout(Duration::from_millis(50));
        let sink = TelemetrySink::start_with_alerter(config, writer, alerter.clone()).unwrap();

        sink.offer_telemetry(1u32, Duration::ZERO, Duration::ZERO, false)
            .await
            .unwrap();
        sink.flush();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(sink.is_shut_down());
        let stats = sink.stats();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.written, 0);
        assert!(stats.last_written_at.is_none());
        assert!(stats
            .shutdown_reason
            .as_deref()
            .unwrap()
            .contains("did not finish"));
        assert!(lines.lock().is_empty());
        assert_eq!(alerter.alerts.lock().len(), 1);

        assert!(!sink.shut_down("operator").await);
        assert!(!sink.shut_down("operator").await);
        assert_eq!(alerter.alerts.lock().len(), 1);
        assert_eq!(sink.stats().failed_flushes, 1);
    }

    #[tokio::test]
    async fn test_partial_append_counts_as_failed_flush() {
        let writer = MemoryWriter::new().failing_after(2);
        let lines = writer.lines();
        let sink = TelemetrySink::start(quiet_config(), writer).unwrap();

        for n in 0..4u32 {
            sink.offer_telemetry(n, Duration::ZERO, Duration::ZERO, false)
                .await
                .unwrap();
        }
        sink.flush();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(sink.is_shut_down());
        let stats = sink.stats();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.written, 0);
        assert!(stats
            .shutdown_reason
            .as_deref()
            .unwrap()
            .contains("after 2 of 4"));
        // The two appended items were never flushed by a successful batch
        assert!(lines.lock().len() <= 2);
    }

    #[tokio::test]
    async fn test_fatal_shutdown_discards_later_items() {
        let writer = MemoryWriter::new().failing_after(0);
        let sink = TelemetrySink::start(quiet_config(), writer).unwrap();

        sink.offer_telemetry(1u32, Duration::ZERO, Duration::ZERO, false)
            .await
            .unwrap();
        sink.flush();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink.is_shut_down());

        assert!(matches!(
            sink.offer_telemetry(2, Duration::ZERO, Duration::ZERO, true)
                .await,
            Err(Error::Unavailable(_))
        ));
    }
}
