//! Buffered, rate-limited telemetry persistence
//!
//! ```text
//! producers ──offer_telemetry──► PermitLimiter ──► BoundedQueue (capacity C)
//!                                                        │
//!                                   flush interval / flush() signal
//!                                                        ▼
//!                                         FlushUnit ──► TelemetryWriter
//!                                      (write_timeout watchdog; failure
//!                                       shuts the sink down and alerts)
//! ```

mod alert;
mod item;
mod sink;
mod writer;

pub use alert::{Alerter, LogAlerter};
pub use item::TelemetryItem;
pub use sink::{SinkConfig, SinkError, SinkStats, SinkStatus, TelemetrySink};
pub use writer::{LineFileWriter, MemoryWriter, TelemetryWriter, WriteError};
