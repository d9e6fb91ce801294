//! Error classification
//!
//! Raw transport and HTTP failures become [`ErrorKind`]s here, exactly
//! once. Everything downstream (retry, failover, the caller) works from
//! the classified kind, never from status codes or reqwest internals.

use std::time::Duration;

use meridian_error::ErrorKind;

/// Classify a non-success HTTP status.
///
/// `retry_after` is the parsed `Retry-After` header when the response
/// carried one; `message` is the best error text extracted from the body.
pub(crate) fn classify_status(
    status: u16,
    retry_after: Option<Duration>,
    message: Option<String>,
) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimitExceeded { retry_after },
        401 | 403 => ErrorKind::AuthenticationFailed { status },
        400 | 422 => ErrorKind::ValidationFailed {
            status,
            message: message.unwrap_or_else(|| "request rejected".to_string()),
        },
        404 => ErrorKind::NotFound,
        500..=599 => ErrorKind::ServerError { status },
        _ => ErrorKind::Unknown {
            message: message.unwrap_or_else(|| format!("unexpected HTTP status {status}")),
        },
    }
}

/// Classify a transport-level failure (no HTTP response was produced).
pub(crate) fn classify_transport(err: &reqwest::Error, elapsed: Duration) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::NetworkTimeout { elapsed }
    } else if err.is_connect() {
        ErrorKind::ConnectionFailed {
            message: err.to_string(),
        }
    } else {
        ErrorKind::Unknown {
            message: err.to_string(),
        }
    }
}
