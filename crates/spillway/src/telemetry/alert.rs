//! Operator alerting for fatal sink conditions

use async_trait::async_trait;
use tracing::error;

/// Receives alerts when a sink shuts itself down
///
/// Mail, paging and chat integrations live behind this trait.
#[async_trait]
pub trait Alerter: Send + Sync + 'static {
    async fn alert(&self, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Alerter that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        error!(subject, body, "ALERT");
        Ok(())
    }
}
