//! Pool error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a queued or incoming acquisition was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The key was evicted (account removed or re-authenticated).
    Evicted,
    /// The whole pool was shut down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evicted => f.write_str("key evicted"),
            Self::Shutdown => f.write_str("pool shut down"),
        }
    }
}

/// Errors returned by [`KeyedPool::acquire`](super::KeyedPool::acquire).
///
/// Every variant is reported only to the caller it affects; none of them
/// leave shared pool state inconsistent.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The connection factory failed. The reserved capacity was given back
    /// and the pool does not retry.
    #[error("failed to create connection: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The caller waited the full wait timeout without being served.
    #[error("connection acquisition timed out after {0:?}")]
    Timeout(Duration),

    /// The key or the pool went away while the caller was waiting.
    /// Terminal for this attempt.
    #[error("connection acquisition cancelled: {0}")]
    Cancelled(CancelReason),
}

impl PoolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The cancellation reason, if this is a cancellation.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            Self::Cancelled(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let timeout = PoolError::Timeout(Duration::from_millis(100));
        assert!(timeout.is_timeout());
        assert!(!timeout.is_cancelled());
        assert_eq!(timeout.cancel_reason(), None);

        let cancelled = PoolError::Cancelled(CancelReason::Evicted);
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.cancel_reason(), Some(CancelReason::Evicted));
    }

    #[test]
    fn test_connect_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = PoolError::Connect(Box::new(io));
        assert_eq!(err.to_string(), "failed to create connection: refused");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_cancel_display() {
        let err = PoolError::Cancelled(CancelReason::Shutdown);
        assert_eq!(err.to_string(), "connection acquisition cancelled: pool shut down");
    }
}
