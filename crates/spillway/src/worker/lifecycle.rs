//! Cooperative worker lifecycle
//!
//! A [`Worker`] is a generic runner: it owns the state machine, the stop
//! flag and the loop, while the actual behavior is a [`WorkUnit`] strategy
//! injected at [`Worker::start`]. Queue polling, pool scaling and telemetry
//! flushing are all work units driven by the same runner.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Worker lifecycle state
///
/// ```text
/// Created ──start()──► Running ──request_stop()──► StopRequested ──loop exit──► Stopped
///    │                    │                                                       ▲
///    │                    └───────────────── fatal error ─────────────────────────┤
///    └────────────────────────────── request_stop() ──────────────────────────────┘
/// ```
///
/// `Stopped` is terminal. A stopped worker is never restarted; create a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    StopRequested,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::StopRequested => write!(f, "stop_requested"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Failure of a single work iteration
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkError {
    /// Logged and absorbed; the loop continues
    #[error("{0}")]
    Recoverable(String),

    /// Ends the loop and triggers the shutdown hook
    #[error("fatal: {0}")]
    Fatal(String),
}

impl WorkError {
    pub fn recoverable(msg: impl Into<String>) -> Self {
        WorkError::Recoverable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        WorkError::Fatal(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkError::Fatal(_))
    }
}

/// Lifecycle misuse and shutdown errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// `start()` called on a worker that is not in `Created`
    #[error("worker {name} cannot start from state {state}")]
    InvalidState { name: String, state: WorkerState },

    /// The loop did not exit within the shutdown bound
    #[error("worker {name} did not stop within {timeout:?}")]
    ShutdownTimeout { name: String, timeout: Duration },
}

/// Why the work loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// `request_stop()` was observed
    StopRequested,
    /// A unit returned [`WorkError::Fatal`]
    Fatal(String),
}

/// Stop flag as seen from inside a running unit
///
/// Units must race every blocking wait against [`StopSignal::stopped`] so a
/// stop request is observed while waiting, not only between iterations.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Whether a stop has been requested (or the owning worker was dropped)
    pub fn is_stop_requested(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once a stop is requested
    pub async fn stopped(&mut self) {
        // Err means the sender is gone, which is a stop as well
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Sleep for `duration` unless stopped first
    ///
    /// Returns `true` if the sleep was cut short by a stop request.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.stopped() => true,
        }
    }
}

/// One unit of repeatable work driven by a [`Worker`]
#[async_trait]
pub trait WorkUnit: Send + 'static {
    /// Execute one iteration
    ///
    /// Blocking waits inside must be bounded and must watch `stop`.
    async fn run_once(&mut self, stop: &mut StopSignal) -> Result<(), WorkError>;

    /// Called exactly once after the loop exits
    async fn on_shutdown(&mut self, _reason: &ExitReason) {}
}

/// Generic cooperative worker
///
/// # Example
///
/// ```ignore
/// let worker = Worker::new("flusher-1", "telemetry");
/// worker.start(FlushUnit::new(...))?;
/// // ...
/// worker.shutdown(Duration::from_secs(5)).await?;
/// ```
pub struct Worker {
    name: String,
    group: String,
    state: Arc<watch::Sender<WorkerState>>,
    stop_tx: watch::Sender<bool>,
}

impl Worker {
    /// Create a worker in `Created` state
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        let (state, _) = watch::channel(WorkerState::Created);
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            group: group.into(),
            state: Arc::new(state),
            stop_tx,
        }
    }

    /// Worker name used in diagnostics
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical group (pool or sink name)
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Whether the loop is running and has not been asked to stop
    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Transition `Created → Running` and spawn the work loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<U: WorkUnit>(&self, unit: U) -> Result<(), WorkerError> {
        let mut refused = None;
        self.state.send_if_modified(|state| {
            if *state == WorkerState::Created {
                *state = WorkerState::Running;
                true
            } else {
                refused = Some(*state);
                false
            }
        });
        if let Some(state) = refused {
            return Err(WorkerError::InvalidState {
                name: self.name.clone(),
                state,
            });
        }

        let stop = StopSignal::new(self.stop_tx.subscribe());
        let state = Arc::clone(&self.state);
        let name = self.name.clone();
        let group = self.group.clone();

        tokio::spawn(run_loop(name, group, unit, stop, state));
        Ok(())
    }

    /// Set the cooperative stop flag
    ///
    /// A worker that was never started goes straight to `Stopped`.
    pub fn request_stop(&self) {
        self.state.send_if_modified(|state| match *state {
            WorkerState::Running => {
                *state = WorkerState::StopRequested;
                true
            }
            WorkerState::Created => {
                *state = WorkerState::Stopped;
                true
            }
            _ => false,
        });
        self.stop_tx.send_replace(true);
    }

    /// Request a stop and wait, up to `timeout`, for the loop to exit
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), WorkerError> {
        self.request_stop();

        let mut state_rx = self.state.subscribe();
        let exited = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| *state == WorkerState::Stopped),
        )
        .await;

        match exited {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(worker = %self.name, group = %self.group, ?timeout, "Worker did not stop in time");
                Err(WorkerError::ShutdownTimeout {
                    name: self.name.clone(),
                    timeout,
                })
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("state", &self.state())
            .finish()
    }
}

async fn run_loop<U: WorkUnit>(
    name: String,
    group: String,
    mut unit: U,
    mut stop: StopSignal,
    state: Arc<watch::Sender<WorkerState>>,
) {
    info!(worker = %name, group = %group, "Worker started");

    let reason = loop {
        if stop.is_stop_requested() {
            break ExitReason::StopRequested;
        }

        match AssertUnwindSafe(unit.run_once(&mut stop))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(WorkError::Recoverable(msg))) => {
                warn!(worker = %name, error = %msg, "Work iteration failed");
                tokio::task::yield_now().await;
            }
            Ok(Err(WorkError::Fatal(msg))) => {
                error!(worker = %name, error = %msg, "Fatal error, stopping worker");
                break ExitReason::Fatal(msg);
            }
            Err(panic) => {
                error!(worker = %name, panic = %panic_message(&*panic), "Work iteration panicked");
                tokio::task::yield_now().await;
            }
        }
    };

    if AssertUnwindSafe(unit.on_shutdown(&reason))
        .catch_unwind()
        .await
        .is_err()
    {
        error!(worker = %name, "Shutdown hook panicked");
    }

    state.send_replace(WorkerState::Stopped);
    debug!(worker = %name, ?reason, "Worker loop exited");
    info!(worker = %name, group = %group, "Worker stopped");
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts iterations; fails or panics on configured iterations
    struct CountingUnit {
        iterations: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        fail_on: Option<usize>,
        fatal_on: Option<usize>,
        panic_on: Option<usize>,
        last_reason: Arc<parking_lot::Mutex<Option<ExitReason>>>,
    }

    impl CountingUnit {
        fn new() -> Self {
            Self {
                iterations: Arc::new(AtomicUsize::new(0)),
                shutdowns: Arc::new(AtomicUsize::new(0)),
                fail_on: None,
                fatal_on: None,
                panic_on: None,
                last_reason: Arc::new(parking_lot::Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl WorkUnit for CountingUnit {
        async fn run_once(&mut self, stop: &mut StopSignal) -> Result<(), WorkError> {
            let n = self.iterations.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on == Some(n) {
                panic!("iteration {n} exploded");
            }
            if self.fail_on == Some(n) {
                return Err(WorkError::recoverable("transient"));
            }
            if self.fatal_on == Some(n) {
                return Err(WorkError::fatal("resource gone"));
            }
            stop.sleep(Duration::from_millis(5)).await;
            Ok(())
        }

        async fn on_shutdown(&mut self, reason: &ExitReason) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            *self.last_reason.lock() = Some(reason.clone());
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let worker = Worker::new("w-1", "test");
        assert_eq!(worker.state(), WorkerState::Created);

        let unit = CountingUnit::new();
        let shutdowns = Arc::clone(&unit.shutdowns);
        let reason = Arc::clone(&unit.last_reason);
        worker.start(unit).unwrap();
        assert!(worker.is_running());

        tokio::time::sleep(Duration::from_millis(30)).await;
        worker.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(*reason.lock(), Some(ExitReason::StopRequested));
    }

    #[tokio::test]
    async fn test_stopped_worker_cannot_restart() {
        let worker = Worker::new("w-1", "test");
        worker.start(CountingUnit::new()).unwrap();
        worker.shutdown(Duration::from_secs(1)).await.unwrap();

        let err = worker.start(CountingUnit::new()).unwrap_err();
        assert!(matches!(
            err,
            WorkerError::InvalidState {
                state: WorkerState::Stopped,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let worker = Worker::new("w-1", "test");
        worker.start(CountingUnit::new()).unwrap();
        assert!(worker.start(CountingUnit::new()).is_err());
        worker.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_recoverable_errors_and_panics_do_not_stop_loop() {
        let worker = Worker::new("w-1", "test");
        let mut unit = CountingUnit::new();
        unit.fail_on = Some(1);
        unit.panic_on = Some(2);
        let iterations = Arc::clone(&unit.iterations);
        worker.start(unit).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(worker.is_running());
        assert!(iterations.load(Ordering::SeqCst) > 2);

        worker.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_error_stops_loop_and_runs_hook_once() {
        let worker = Worker::new("w-1", "test");
        let mut unit = CountingUnit::new();
        unit.fatal_on = Some(3);
        let shutdowns = Arc::clone(&unit.shutdowns);
        let reason = Arc::clone(&unit.last_reason);
        worker.start(unit).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(
            *reason.lock(),
            Some(ExitReason::Fatal("resource gone".to_string()))
        );

        // Already stopped: shutdown returns immediately
        worker.shutdown(Duration::from_millis(10)).await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_interrupts_blocking_wait() {
        struct SleepyUnit;

        #[async_trait]
        impl WorkUnit for SleepyUnit {
            async fn run_once(&mut self, stop: &mut StopSignal) -> Result<(), WorkError> {
                stop.sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let worker = Worker::new("sleepy", "test");
        worker.start(SleepyUnit).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = std::time::Instant::now();
        worker.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_shutdown_timeout() {
        struct StubbornUnit;

        #[async_trait]
        impl WorkUnit for StubbornUnit {
            async fn run_once(&mut self, _stop: &mut StopSignal) -> Result<(), WorkError> {
                // Ignores the stop signal on purpose
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(())
            }
        }

        let worker = Worker::new("stubborn", "test");
        worker.start(StubbornUnit).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = worker
            .shutdown(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ShutdownTimeout { .. }));
        assert_eq!(worker.state(), WorkerState::StopRequested);

        // Eventually exits once the current iteration completes
        worker.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let worker = Worker::new("never", "test");
        worker.request_stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
        worker.shutdown(Duration::from_millis(10)).await.unwrap();
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
