//! Buffered telemetry record

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A producer's payload plus its buffering timestamps
///
/// `written_at` is set once, by the flush worker, after the append is
/// confirmed and the writer has flushed.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryItem<T> {
    pub content: T,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written_at: Option<DateTime<Utc>>,
}

impl<T> TelemetryItem<T> {
    pub fn new(content: T) -> Self {
        Self {
            content,
            created_at: Utc::now(),
            written_at: None,
        }
    }

    /// Record the confirmed write; later calls keep the first timestamp
    pub fn mark_written(&mut self, at: DateTime<Utc>) -> bool {
        if self.written_at.is_some() {
            return false;
        }
        self.written_at = Some(at);
        true
    }

    pub fn is_written(&self) -> bool {
        self.written_at.is_some()
    }
}
