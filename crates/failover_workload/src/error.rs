//! Error taxonomy for write attempts and the four-way retry classification.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Coarse error class used for retry decisions, log lines and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The connection dropped or could not be established. This is what a
    /// failover looks like from the client side.
    ConnectionLost,
    /// The attempt did not complete in time (statement or pool wait).
    Timeout,
    /// The server aborted the write to break a deadlock.
    Deadlock,
    /// Anything else: constraint violations, missing tables, bad SQL.
    Other,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 4] = [
        ErrorClass::ConnectionLost,
        ErrorClass::Timeout,
        ErrorClass::Deadlock,
        ErrorClass::Other,
    ];

    /// Stable lowercase label used in log lines and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::ConnectionLost => "connection_lost",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Deadlock => "deadlock",
            ErrorClass::Other => "other",
        }
    }

    /// Only connection-level and timeout failures are retried; retrying a
    /// deadlock or a query error would hide real bugs behind backoff.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::ConnectionLost | ErrorClass::Timeout)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one physical attempt, pool checkout or identity lookup.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkloadError {
    #[error("connection pool exhausted: no connection available within {0:?}")]
    PoolExhausted(Duration),
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("deadlock detected: {0}")]
    Deadlock(String),
    #[error("{0}")]
    Other(String),
    #[error("identity lookup failed: {0}")]
    IdentityLookupFailed(String),
}

impl WorkloadError {
    /// Maps the error onto the retry taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            WorkloadError::ConnectFailed(_) | WorkloadError::ConnectionLost(_) => {
                ErrorClass::ConnectionLost
            }
            WorkloadError::PoolExhausted(_) | WorkloadError::Timeout(_) => ErrorClass::Timeout,
            WorkloadError::Deadlock(_) => ErrorClass::Deadlock,
            WorkloadError::PoolClosed
            | WorkloadError::Other(_)
            | WorkloadError::IdentityLookupFailed(_) => ErrorClass::Other,
        }
    }

    /// Builds an error of the given class carrying `message`.
    pub fn from_class(class: ErrorClass, message: impl Into<String>) -> Self {
        let message = message.into();
        match class {
            ErrorClass::ConnectionLost => WorkloadError::ConnectionLost(message),
            ErrorClass::Timeout => WorkloadError::Timeout(message),
            ErrorClass::Deadlock => WorkloadError::Deadlock(message),
            ErrorClass::Other => WorkloadError::Other(message),
        }
    }

    /// Whether the connection that produced this error must not be reused.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::ConnectionLost | ErrorClass::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_and_connect_errors_fold_into_retryable_classes() {
        let exhausted = WorkloadError::PoolExhausted(Duration::from_secs(30));
        assert_eq!(exhausted.class(), ErrorClass::Timeout);
        assert!(exhausted.class().is_retryable());

        let connect = WorkloadError::ConnectFailed("refused".into());
        assert_eq!(connect.class(), ErrorClass::ConnectionLost);
        assert!(connect.class().is_retryable());
    }

    #[test]
    fn deadlock_and_other_are_terminal() {
        assert!(!ErrorClass::Deadlock.is_retryable());
        assert!(!ErrorClass::Other.is_retryable());
        assert_eq!(WorkloadError::PoolClosed.class(), ErrorClass::Other);
    }

    #[test]
    fn from_class_preserves_class() {
        for class in ErrorClass::ALL {
            assert_eq!(WorkloadError::from_class(class, "x").class(), class);
        }
    }
}
