//! Line-oriented persistence targets for the telemetry sink

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Writer errors
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("writer is closed")]
    Closed,
}

/// Append-only sink for newline-delimited UTF-8 records
///
/// `append` may buffer; a record counts as persisted only after a
/// successful `flush`.
#[async_trait]
pub trait TelemetryWriter: Send + 'static {
    /// Append one record; `line` carries no trailing newline
    async fn append(&mut self, line: &str) -> Result<(), WriteError>;

    /// Push buffered records to the backing store
    async fn flush(&mut self) -> Result<(), WriteError>;

    /// Flush and release the backing store
    async fn close(&mut self) -> Result<(), WriteError> {
        self.flush().await
    }
}

/// Appends records to a file, one per line
pub struct LineFileWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl LineFileWriter {
    /// Open `path` for appending, creating it and its parent directories
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, WriteError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TelemetryWriter for LineFileWriter {
    async fn append(&mut self, line: &str) -> Result<(), WriteError> {
        let file = self.file.as_mut().ok_or(WriteError::Closed)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), WriteError> {
        let file = self.file.as_mut().ok_or(WriteError::Closed)?;
        file.flush().await?;
        file.get_ref().sync_data().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), WriteError> {
        if self.file.is_some() {
            self.flush().await?;
            self.file = None;
        }
        Ok(())
    }
}

/// In-memory writer for tests and demos
///
/// Appended lines become visible through [`lines`](Self::lines) on flush.
/// Can be slowed down or made to fail to exercise the sink's watchdog.
#[derive(Default)]
pub struct MemoryWriter {
    lines: Arc<Mutex<Vec<String>>>,
    pending: Vec<String>,
    append_delay: Option<Duration>,
    fail_after: Option<usize>,
    appended: usize,
    closed: bool,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in every `append`
    pub fn with_append_delay(mut self, delay: Duration) -> Self {
        self.append_delay = Some(delay);
        self
    }

    /// Fail every `append` after the first `n`
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Shared handle to the flushed lines
    pub fn lines(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.lines)
    }
}

#[async_trait]
impl TelemetryWriter for MemoryWriter {
    async fn append(&mut self, line: &str) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        if let Some(delay) = self.append_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_after.is_some_and(|n| self.appended >= n) {
            return Err(WriteError::Io(std::io::Error::other("injected append failure")));
        }
        self.pending.push(line.to_string());
        self.appended += 1;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        self.lines.lock().append(&mut self.pending);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), WriteError> {
        if !self.closed {
            self.flush().await?;
            self.closed = true;
        }
        Ok(())
    }
}
