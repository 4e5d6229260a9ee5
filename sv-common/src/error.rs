//! Common error types for SemperVigil
//!
//! Every error carries a [`ErrorKind`] so the worker loop can decide whether
//! a failed job should be retried, failed immediately, or marked canceled
//! without inspecting message text.

use thiserror::Error;

/// Common result type for SemperVigil operations
pub type Result<T> = std::result::Result<T, Error>;

/// Retry classification for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad inputs; never retried, surfaced to the caller.
    Validation,
    /// Referenced entity missing; never retried.
    NotFound,
    /// Timeout, 5xx, lock contention, connection loss; retried with backoff.
    Transient,
    /// 429 or provider throttle; retried with a longer backoff.
    RateLimited,
    /// 4xx (except 408/429) or constraint violation on bad data; failed immediately.
    Permanent,
    /// Explicit cancel; not retried.
    Canceled,
    /// Unexpected; failed after one attempt.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether the queue should requeue a job that failed with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::RateLimited)
    }
}

/// Common error type across the SemperVigil services
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// From a `Retry-After` header when the provider supplied one.
        retry_after_seconds: Option<u64>,
    },

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Canceled")]
    Canceled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error for the retry decision.
    ///
    /// Database errors are split into transient (lock contention, pool
    /// exhaustion, connection loss) and permanent (constraint violations);
    /// anything unrecognized is internal.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Database(err) => classify_sqlx(err),
            Error::Io(_) => ErrorKind::Transient,
            Error::Config(_) => ErrorKind::Validation,
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Transient(_) => ErrorKind::Transient,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Permanent(_) => ErrorKind::Permanent,
            Error::Canceled => ErrorKind::Canceled,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Map an HTTP status from an outbound request into the taxonomy.
    ///
    /// 429 and 408 are retryable, other 4xx are permanent, 5xx transient.
    pub fn from_http_status(status: u16, body: impl Into<String>) -> Error {
        let message = format!("HTTP {}: {}", status, body.into());
        match status {
            429 => Error::RateLimited {
                message,
                retry_after_seconds: None,
            },
            408 => Error::Transient(message),
            400..=499 => Error::Permanent(message),
            _ => Error::Transient(message),
        }
    }
}

fn classify_sqlx(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            if message.contains("locked") || message.contains("busy") {
                ErrorKind::Transient
            } else if message.contains("constraint") || message.contains("unique") {
                ErrorKind::Permanent
            } else {
                ErrorKind::Internal
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
            ErrorKind::Transient
        }
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        _ => ErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        assert_eq!(
            Error::from_http_status(429, "slow down").kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            Error::from_http_status(404, "gone").kind(),
            ErrorKind::Permanent
        );
        assert_eq!(
            Error::from_http_status(408, "timeout").kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            Error::from_http_status(503, "flaky").kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
        assert!(!ErrorKind::Canceled.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
    }
}
