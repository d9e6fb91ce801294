//! # Meridian Client
//!
//! Typed client for a multi-zone PSA/ticketing REST API, built around a
//! reliability core: per-zone rate limiting, per-(endpoint, zone)
//! circuit breaking, retry with exponential backoff, zone failover, and
//! a priority queue with backpressure in front of every outgoing call.
//!
//! ## Quick start
//!
//! ```no_run
//! use meridian_client::prelude::*;
//! use std::time::Duration;
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new(Credentials::new("CODE", "api-user@example.com", "secret"))
//!         .with_zone(ZoneConfig::new(
//!             "zone-a",
//!             Url::parse("https://zone-a.example.com/rest/v1.0")?,
//!         ))
//!         .with_retry(RetryConfig::default().with_max_attempts(4));
//!     let client = Client::new(config)?;
//!
//!     let tickets = client.entity("Tickets");
//!     let open: ItemsResponse<serde_json::Value> = tickets
//!         .query(&Query::new(Filter::eq("status", 1)).with_page_size(50))
//!         .await?;
//!     println!("{} open tickets", open.items.len());
//!
//!     client.destroy();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Entity handles build HTTP request closures and hand them to the
//! [`ReliabilityManager`](reliability::ReliabilityManager) queue. The
//! queue admits them under backpressure rules and dispatches by priority
//! under a concurrency bound; each dispatch passes the rate-limit gate,
//! resolves a zone, and runs a circuit-protected retry sequence there,
//! failing over at most once to the next eligible zone. Failures are
//! classified exactly once into the
//! [`ErrorKind`](meridian_error::ErrorKind) taxonomy and carry endpoint,
//! zone, request id and timestamp for diagnosis.

#![deny(missing_docs)]

pub mod client;
pub mod config;
mod error_handler;
pub mod filter;
pub mod hooks;
pub mod reliability;
pub mod transport;

pub use client::{Client, EntityHandle, ItemResponse, ItemsResponse, PageDetails, SaveResponse};
pub use config::{
    ClientConfig, CircuitBreakerConfig, Credentials, QueueConfig, RateLimitConfig, RetryConfig,
    ZoneConfig, DEFAULT_DISCOVERY_URL,
};
pub use filter::{Filter, FilterOp, Query, SortDirection};
pub use reliability::{
    CircuitState, HealthStatus, QueueStatistics, RateLimitMetrics, ReliabilityMetrics,
    RequestOptions, RetryMetrics, SystemHealth, ZoneHealth, ZoneStatistics,
};
pub use transport::{ApiRequest, ApiResponse};

// Re-export the error crate so callers need only one dependency.
pub use meridian_error::{ApiError, ErrorContext, ErrorKind, Result, Retryable};

/// Common imports for client users.
pub mod prelude {
    pub use crate::client::{Client, EntityHandle, ItemResponse, ItemsResponse};
    pub use crate::config::{
        ClientConfig, Credentials, RateLimitConfig, RetryConfig, ZoneConfig,
    };
    pub use crate::filter::{Filter, Query, SortDirection};
    pub use crate::reliability::RequestOptions;
    pub use meridian_error::{ApiError, ErrorKind, Result, Retryable};
}
