// Configuration
//
// Every component config has code defaults; `SpillwayConfig` layers
// `SPILLWAY_*` environment variables or a JSON document on top of them.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate::RateControlConfig;
use crate::telemetry::SinkConfig;
use crate::worker::PoolConfig;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// A section failed validation
    #[error("invalid {section} configuration: {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },

    /// A JSON document could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level configuration for a pool, a telemetry sink and a rate controller
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpillwayConfig {
    pub pool: PoolConfig,
    pub sink: SinkConfig,
    pub rate: RateControlConfig,
    /// File the telemetry sink appends to; in-memory when unset
    pub telemetry_path: Option<PathBuf>,
}

impl SpillwayConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables (all optional):
    /// - `SPILLWAY_POOL_NAME`, `SPILLWAY_POOL_WORKER_PREFIX`
    /// - `SPILLWAY_POOL_MIN_WORKERS`, `SPILLWAY_POOL_MAX_WORKERS`
    /// - `SPILLWAY_POOL_QUEUE_CAPACITY`, `SPILLWAY_POOL_SHUTDOWN_TIMEOUT_MS`
    /// - `SPILLWAY_POLL_TIMEOUT_MS`, `SPILLWAY_IDLE_INTERVAL_MS`
    /// - `SPILLWAY_SINK_NAME`, `SPILLWAY_SINK_CAPACITY`, `SPILLWAY_SINK_PERMITS_PER_SECOND`
    /// - `SPILLWAY_SINK_FLUSH_INTERVAL_MS`, `SPILLWAY_SINK_WRITE_TIMEOUT_MS`
    /// - `SPILLWAY_SINK_PATH`
    /// - `SPILLWAY_RATE_MAX_CALLS_PER_SECOND`, `SPILLWAY_RATE_WINDOW_SECONDS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(name) = lookup("SPILLWAY_POOL_NAME") {
            config.pool.name = name;
        }
        if let Some(prefix) = lookup("SPILLWAY_POOL_WORKER_PREFIX") {
            config.pool.worker_name_prefix = prefix;
        }
        if let Some(v) = parsed(&lookup, "SPILLWAY_POOL_MIN_WORKERS")? {
            config.pool.min_workers = v;
        }
        if let Some(v) = parsed(&lookup, "SPILLWAY_POOL_MAX_WORKERS")? {
            config.pool.max_workers = v;
        }
        if let Some(v) = parsed(&lookup, "SPILLWAY_POOL_QUEUE_CAPACITY")? {
            config.pool.queue_capacity = v;
        }
        if let Some(v) = millis(&lookup, "SPILLWAY_POOL_SHUTDOWN_TIMEOUT_MS")? {
            config.pool.shutdown_timeout = v;
        }
        if let Some(v) = millis(&lookup, "SPILLWAY_POLL_TIMEOUT_MS")? {
            config.pool.poller.poll_timeout = v;
        }
        if let Some(v) = millis(&lookup, "SPILLWAY_IDLE_INTERVAL_MS")? {
            config.pool.poller.min_idle_interval = v;
            config.pool.poller.max_idle_interval = config.pool.poller.max_idle_interval.max(v);
        }

        if let Some(name) = lookup("SPILLWAY_SINK_NAME") {
            config.sink.name = name;
        }
        if let Some(v) = parsed(&lookup, "SPILLWAY_SINK_CAPACITY")? {
            config.sink.capacity = v;
        }
        if let Some(v) = parsed(&lookup, "SPILLWAY_SINK_PERMITS_PER_SECOND")? {
            config.sink.permits_per_second = v;
        }
        if let Some(v) = millis(&lookup, "SPILLWAY_SINK_FLUSH_INTERVAL_MS")? {
            config.sink.flush_interval = v;
        }
        if let Some(v) = millis(&lookup, "SPILLWAY_SINK_WRITE_TIMEOUT_MS")? {
            config.sink.write_timeout = v;
            config.sink.shutdown_timeout = config.sink.shutdown_timeout.max(v);
        }
        config.telemetry_path = lookup("SPILLWAY_SINK_PATH")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        if let Some(v) = parsed(&lookup, "SPILLWAY_RATE_MAX_CALLS_PER_SECOND")? {
            config.rate.max_calls_per_second = v;
        }
        if let Some(v) = parsed(&lookup, "SPILLWAY_RATE_WINDOW_SECONDS")? {
            config.rate.window_seconds = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate().map_err(|e| ConfigError::Invalid {
            section: "pool",
            reason: e.to_string(),
        })?;
        self.sink.validate().map_err(|reason| ConfigError::Invalid {
            section: "sink",
            reason,
        })?;
        self.rate.validate().map_err(|reason| ConfigError::Invalid {
            section: "rate",
            reason,
        })?;
        Ok(())
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                reason: e.to_string(),
                value,
            }),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parsed::<u64>(lookup, key)?.map(Duration::from_millis))
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
