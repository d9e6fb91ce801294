//! Request context attached to classified errors for observability.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where and when a failure happened.
///
/// Attached once, at classification time, by the component that saw the
/// failure. The timestamp is taken at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// API endpoint path, e.g. `/Tickets/query`.
    pub endpoint: String,
    /// HTTP method of the failed request.
    pub method: String,
    /// Zone the request was routed to, when routing had happened.
    pub zone: Option<String>,
    /// Client-assigned request id.
    pub request_id: Option<String>,
    /// When the failure was classified.
    pub timestamp: DateTime<Utc>,
    /// Free-form caller metadata carried through from the request options.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ErrorContext {
    /// Create context for an endpoint and method.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            zone: None,
            request_id: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Record the zone the request was routed to.
    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// Record the client-assigned request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
