//! # Meridian Error
//!
//! Error types for the Meridian client. Every failure the client surfaces
//! is an [`ApiError`]: a classified [`ErrorKind`] plus an optional
//! [`ErrorContext`] naming the endpoint, method, zone and request id the
//! failure belongs to.
//!
//! Errors are classified exactly once, at the transport boundary, and are
//! never re-wrapped afterwards. Retryability is a property of the kind
//! (see [`Retryable`]), so callers and the retry machinery agree on which
//! failures are worth another attempt.

#![deny(missing_docs)]

mod context;
mod kinds;

pub use context::ErrorContext;
pub use kinds::{codes, ErrorKind};

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of an error's worth for retry decisions.
pub trait Retryable {
    /// Whether another attempt at the same operation may succeed.
    fn is_retryable(&self) -> bool;

    /// Suggested delay before the next attempt, when the failure carries one
    /// (e.g. a rate-limit response with a `Retry-After` header).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Stable machine-readable code for an error, independent of its message.
pub trait ErrorCode {
    /// The error code, one of the constants in [`codes`].
    fn error_code(&self) -> &'static str;
}

/// Primary error type for the Meridian client.
///
/// The kind is boxed to keep the `Err` arm of results small; context is
/// allocated lazily, only when a component attaches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// The classified kind of failure.
    pub kind: Box<ErrorKind>,
    /// Where the failure happened, when known.
    pub context: Option<Box<ErrorContext>>,
}

impl ApiError {
    /// Create an error from a classified kind.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            context: None,
        }
    }

    /// Attach request context to this error.
    #[must_use]
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(Box::new(context));
        self
    }

    /// The classified kind of this error.
    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The request context, when one was attached.
    #[must_use]
    pub fn context(&self) -> Option<&ErrorContext> {
        self.context.as_deref()
    }

    /// Create a rate-limit error, optionally carrying the server's
    /// `Retry-After` hint.
    #[must_use]
    pub fn rate_limit_exceeded(retry_after: Option<Duration>) -> Self {
        Self::new(ErrorKind::RateLimitExceeded { retry_after })
    }

    /// Create an authentication failure from an HTTP status (401/403).
    #[must_use]
    pub fn authentication_failed(status: u16) -> Self {
        Self::new(ErrorKind::AuthenticationFailed { status })
    }

    /// Create a validation failure from an HTTP status (400/422).
    #[must_use]
    pub fn validation_failed(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationFailed {
            status,
            message: message.into(),
        })
    }

    /// Create a not-found error (404).
    #[must_use]
    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound)
    }

    /// Create a server error from an HTTP status (5xx).
    #[must_use]
    pub fn server_error(status: u16) -> Self {
        Self::new(ErrorKind::ServerError { status })
    }

    /// Create a network timeout error.
    #[must_use]
    pub fn network_timeout(elapsed: Duration) -> Self {
        Self::new(ErrorKind::NetworkTimeout { elapsed })
    }

    /// Create a connection failure.
    #[must_use]
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailed {
            message: message.into(),
        })
    }

    /// Create a circuit-open fail-fast error, optionally carrying the time
    /// until the breaker permits a probe.
    #[must_use]
    pub fn circuit_open(retry_after: Option<Duration>) -> Self {
        Self::new(ErrorKind::CircuitOpen { retry_after })
    }

    /// Create a queue-timeout error: the request was not dispatched and
    /// completed within its own timeout.
    #[must_use]
    pub fn queue_timeout(elapsed: Duration) -> Self {
        Self::new(ErrorKind::QueueTimeout { elapsed })
    }

    /// Create a load-shed error: the queue refused the request.
    #[must_use]
    pub fn queue_overloaded(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueOverloaded {
            reason: reason.into(),
        })
    }

    /// Create a configuration validation error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig {
            message: message.into(),
        })
    }

    /// Create an unclassified error.
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown {
            message: message.into(),
        })
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, " ({} {}", ctx.method, ctx.endpoint)?;
            if let Some(zone) = &ctx.zone {
                write!(f, ", zone {zone}")?;
            }
            if let Some(id) = &ctx.request_id {
                write!(f, ", request {id}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    fn retry_after(&self) -> Option<Duration> {
        self.kind.retry_after()
    }
}

impl ErrorCode for ApiError {
    fn error_code(&self) -> &'static str {
        self.kind.error_code()
    }
}

/// Convenience result alias used throughout the client.
pub type Result<T> = std::result::Result<T, ApiError>;
