//! Error taxonomy
//!
//! One kind per failure class the client distinguishes. Retryability is a
//! property of the kind: transient transport and server-side failures are
//! retryable, everything the caller must fix (auth, validation, missing
//! resources) is not.

#![allow(missing_docs)] // Enum variant fields are self-explanatory

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ErrorCode, Retryable};

/// Stable error code constants, one per [`ErrorKind`] variant.
pub mod codes {
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const AUTHENTICATION_FAILED: &str = "AUTHENTICATION_FAILED";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const SERVER_ERROR: &str = "SERVER_ERROR";
    pub const NETWORK_TIMEOUT: &str = "NETWORK_TIMEOUT";
    pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const QUEUE_TIMEOUT: &str = "QUEUE_TIMEOUT";
    pub const QUEUE_OVERLOADED: &str = "QUEUE_OVERLOADED";
    pub const INVALID_CONFIG: &str = "INVALID_CONFIG";
    pub const UNKNOWN: &str = "UNKNOWN";
}

/// Classified failure kinds.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The zone's request budget is exhausted (HTTP 429).
    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after: Option<Duration> },

    /// Credentials were rejected (HTTP 401/403).
    #[error("authentication failed (HTTP {status})")]
    AuthenticationFailed { status: u16 },

    /// The request body or parameters were rejected (HTTP 400/422).
    #[error("validation failed (HTTP {status}): {message}")]
    ValidationFailed { status: u16, message: String },

    /// The addressed resource does not exist (HTTP 404).
    #[error("resource not found")]
    NotFound,

    /// The server failed to process the request (HTTP 5xx).
    #[error("server error (HTTP {status})")]
    ServerError { status: u16 },

    /// A single attempt exceeded the transport timeout.
    #[error("network timeout after {elapsed:?}")]
    NetworkTimeout { elapsed: Duration },

    /// The connection could not be established.
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    /// The breaker for this endpoint/zone is open; no attempt was made.
    #[error("circuit open")]
    CircuitOpen { retry_after: Option<Duration> },

    /// The request's own timeout expired before it completed.
    #[error("request timed out after {elapsed:?} in queue")]
    QueueTimeout { elapsed: Duration },

    /// The queue refused the request under backpressure.
    #[error("queue overloaded: {reason}")]
    QueueOverloaded { reason: String },

    /// Construction-time configuration validation failed.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Anything that did not match a known class.
    #[error("{message}")]
    Unknown { message: String },
}

impl Retryable for ErrorKind {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. }
                | Self::ServerError { .. }
                | Self::NetworkTimeout { .. }
                | Self::ConnectionFailed { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after } | Self::CircuitOpen { retry_after } => {
                *retry_after
            }
            _ => None,
        }
    }
}

impl ErrorCode for ErrorKind {
    fn error_code(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => codes::RATE_LIMIT_EXCEEDED,
            Self::AuthenticationFailed { .. } => codes::AUTHENTICATION_FAILED,
            Self::ValidationFailed { .. } => codes::VALIDATION_FAILED,
            Self::NotFound => codes::NOT_FOUND,
            Self::ServerError { .. } => codes::SERVER_ERROR,
            Self::NetworkTimeout { .. } => codes::NETWORK_TIMEOUT,
            Self::ConnectionFailed { .. } => codes::CONNECTION_FAILED,
            Self::CircuitOpen { .. } => codes::CIRCUIT_OPEN,
            Self::QueueTimeout { .. } => codes::QUEUE_TIMEOUT,
            Self::QueueOverloaded { .. } => codes::QUEUE_OVERLOADED,
            Self::InvalidConfig { .. } => codes::INVALID_CONFIG,
            Self::Unknown { .. } => codes::UNKNOWN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_taxonomy() {
        assert!(ErrorKind::RateLimitExceeded { retry_after: None }.is_retryable());
        assert!(ErrorKind::ServerError { status: 500 }.is_retryable());
        assert!(
            ErrorKind::NetworkTimeout {
                elapsed: Duration::from_secs(30)
            }
            .is_retryable()
        );
        assert!(
            ErrorKind::ConnectionFailed {
                message: "refused".into()
            }
            .is_retryable()
        );

        assert!(!ErrorKind::AuthenticationFailed { status: 401 }.is_retryable());
        assert!(
            !ErrorKind::ValidationFailed {
                status: 422,
                message: "bad field".into()
            }
            .is_retryable()
        );
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::CircuitOpen { retry_after: None }.is_retryable());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            ErrorKind::ServerError { status: 502 }.error_code(),
            codes::SERVER_ERROR
        );
        assert_eq!(ErrorKind::NotFound.error_code(), codes::NOT_FOUND);
    }
}
