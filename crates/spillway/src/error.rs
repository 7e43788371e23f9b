// Error taxonomy shared by the pool, rate controller and telemetry sink

use std::time::Duration;

use thiserror::Error;

/// Result type alias for spillway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome tags callers are expected to match on
///
/// Every rejection a producer or caller can observe maps to exactly one
/// variant, so retry decisions never depend on error message text.
#[derive(Debug, Error)]
pub enum Error {
    /// Feature intentionally switched off; do not retry until re-enabled
    #[error("disabled")]
    Disabled,

    /// Backing resource unreachable or component shut down
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Self-imposed throttle exceeded
    ///
    /// `wait_for_retry_millis` is `-1` when the call must never be retried and
    /// `0` when the wait is unknown.
    #[error("rate of {rate}/s exceeded (retry in {wait_for_retry_millis}ms)")]
    RateExceeded { rate: u32, wait_for_retry_millis: i64 },

    /// Local backpressure: buffer slot or permit not obtained in time
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// Operation aborted after exceeding its time budget
    #[error("cancelled after {limit:?}")]
    Cancelled { limit: Duration },

    /// Collaborator failure that fits none of the tags above
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Payload-free discriminant of [`Error`], handy for logs and counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Disabled,
    Unavailable,
    RateExceeded,
    Overloaded,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::RateExceeded => write!(f, "rate_exceeded"),
            Self::Overloaded => write!(f, "overloaded"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    /// Create an overloaded error
    pub fn overloaded(msg: impl Into<String>) -> Self {
        Error::Overloaded(msg.into())
    }

    /// Create a rate exceeded error
    pub fn rate_exceeded(rate: u32, wait_for_retry_millis: i64) -> Self {
        Error::RateExceeded {
            rate,
            wait_for_retry_millis,
        }
    }

    /// Tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Disabled => ErrorKind::Disabled,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::RateExceeded { .. } => ErrorKind::RateExceeded,
            Self::Overloaded(_) => ErrorKind::Overloaded,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may try again later without operator action
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Disabled | Self::Internal(_) => false,
            Self::RateExceeded {
                wait_for_retry_millis,
                ..
            } => *wait_for_retry_millis >= 0,
            Self::Unavailable(_) | Self::Overloaded(_) | Self::Cancelled { .. } => true,
        }
    }

    /// Suggested back-off before retrying, when one is known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateExceeded {
                wait_for_retry_millis,
                ..
            } if *wait_for_retry_millis > 0 => {
                Some(Duration::from_millis(*wait_for_retry_millis as u64))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::Disabled.kind(), ErrorKind::Disabled);
        assert_eq!(Error::unavailable("down").kind(), ErrorKind::Unavailable);
        assert_eq!(Error::overloaded("full").kind(), ErrorKind::Overloaded);
        assert_eq!(
            Error::rate_exceeded(10, 250).kind(),
            ErrorKind::RateExceeded
        );
        assert_eq!(
            Error::Cancelled {
                limit: Duration::from_millis(5)
            }
            .kind(),
            ErrorKind::Cancelled
        );
        assert_eq!(
            Error::from(anyhow::anyhow!("boom")).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_retry_hints() {
        assert_eq!(
            Error::rate_exceeded(10, 250).retry_after(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(Error::rate_exceeded(10, 0).retry_after(), None);
        assert!(Error::rate_exceeded(10, 0).is_retryable());
        assert!(!Error::rate_exceeded(0, -1).is_retryable());
        assert!(!Error::Disabled.is_retryable());
        assert!(Error::overloaded("full").is_retryable());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::rate_exceeded(100, 40).to_string(),
            "rate of 100/s exceeded (retry in 40ms)"
        );
        assert_eq!(ErrorKind::RateExceeded.to_string(), "rate_exceeded");
    }
}
