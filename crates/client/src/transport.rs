//! HTTP transport
//!
//! A thin wrapper around `reqwest` that assembles the vendor's auth
//! headers, runs the hook chain around each outgoing call, and converts
//! responses into [`ApiResponse`] with failures classified on the spot.
//! The transport knows nothing about zones or retries; it sends exactly
//! one request against whatever base URL it is handed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use meridian_error::{ApiError, Result};
use parking_lot::RwLock;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;
use crate::error_handler::{classify_status, classify_transport};
use crate::hooks::Hooks;

/// One outbound API call, before zone resolution.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the zone base URL, e.g. `/Tickets/123`.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// Extra headers; pre-request hooks may add to these.
    pub headers: Vec<(String, String)>,
    /// JSON body for methods that carry one.
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Create a request.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// POST request with a JSON body.
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        let mut req = Self::new(Method::POST, path);
        req.body = Some(body);
        req
    }

    /// PUT request with a JSON body.
    pub fn put(path: impl Into<String>, body: Value) -> Self {
        let mut req = Self::new(Method::PUT, path);
        req.body = Some(body);
        req
    }

    /// PATCH request with a JSON body.
    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        let mut req = Self::new(Method::PATCH, path);
        req.body = Some(body);
        req
    }

    /// DELETE request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Append a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// A completed API response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Parsed JSON body, when the response carried one.
    pub body: Option<Value>,
    /// Wall-clock duration of the attempt.
    pub duration: Duration,
}

impl ApiResponse {
    /// Deserialize the body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let body = self
            .body
            .as_ref()
            .ok_or_else(|| ApiError::unknown("response carried no JSON body"))?;
        serde_json::from_value(body.clone())
            .map_err(|e| ApiError::unknown(format!("failed to decode response body: {e}")))
    }
}

/// Best-effort error text from a vendor error body: `{"errors": ["..."]}`.
fn error_message(body: &Value) -> Option<String> {
    body.get("errors")?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .next()
        .map(str::to_string)
}

fn parse_retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// HTTP transport shared by every component that talks to the network.
pub struct Transport {
    client: reqwest::Client,
    credentials_headers: [(&'static str, String); 3],
    hooks: RwLock<Hooks>,
}

impl Transport {
    /// Build the transport from validated configuration.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ApiError::invalid_config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            credentials_headers: [
                ("ApiIntegrationCode", config.credentials.api_integration_code.clone()),
                ("UserName", config.credentials.username.clone()),
                ("Secret", config.credentials.secret.clone()),
            ],
            hooks: RwLock::new(Hooks::default()),
        })
    }

    /// Register a pre-request hook; hooks run in registration order.
    pub fn add_request_hook(
        &self,
        hook: impl Fn(&mut ApiRequest) -> Result<()> + Send + Sync + 'static,
    ) {
        self.hooks.write().add_pre(hook);
    }

    /// Register a post-response hook; hooks run in registration order.
    pub fn add_response_hook(
        &self,
        hook: impl Fn(&ApiResponse) -> Result<()> + Send + Sync + 'static,
    ) {
        self.hooks.write().add_post(hook);
    }

    /// Send one request against `base_url`, classifying any failure.
    ///
    /// Non-success statuses come back as `Err` so the reliability layer can
    /// route on the classified kind; the hook chain runs around the call
    /// with first-error short-circuit semantics.
    pub async fn send(&self, base_url: &Url, request: &ApiRequest) -> Result<ApiResponse> {
        let mut request = request.clone();
        self.hooks.read().run_pre(&mut request)?;

        let url = join_url(base_url, &request.path)?;
        let started = Instant::now();

        let mut builder = self.client.request(request.method.clone(), url);
        for (key, value) in &self.credentials_headers {
            builder = builder.header(*key, value.as_str());
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let raw = builder
            .send()
            .await
            .map_err(|e| ApiError::new(classify_transport(&e, started.elapsed())))?;

        let status = raw.status().as_u16();
        let headers: HashMap<String, String> = raw
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_lowercase(), v.to_str().ok()?.to_string())))
            .collect();

        let bytes = raw
            .bytes()
            .await
            .map_err(|e| ApiError::new(classify_transport(&e, started.elapsed())))?;
        let body: Option<Value> = serde_json::from_slice(&bytes).ok();

        debug!(status, elapsed_ms = started.elapsed().as_millis() as u64, "request completed");

        if !(200..300).contains(&status) {
            let retry_after = parse_retry_after(&headers);
            let message = body.as_ref().and_then(error_message);
            return Err(ApiError::new(classify_status(status, retry_after, message)));
        }

        let response = ApiResponse {
            status,
            headers,
            body,
            duration: started.elapsed(),
        };
        self.hooks.read().run_post(&response)?;
        Ok(response)
    }

    /// Send one request against an absolute URL (discovery, health checks).
    pub async fn send_absolute(&self, url: Url, request: &ApiRequest) -> Result<ApiResponse> {
        // The path on `request` is ignored; the URL is already complete.
        let base = url.clone();
        let mut request = request.clone();
        request.path = String::new();
        self.send(&base, &request).await
    }
}

fn join_url(base: &Url, path: &str) -> Result<Url> {
    if path.is_empty() {
        return Ok(base.clone());
    }
    // Keep the base's own path prefix: trailing-slash base + relative path.
    let mut base_str = base.as_str().to_string();
    if !base_str.ends_with('/') {
        base_str.push('/');
    }
    let joined = format!("{}{}", base_str, path.trim_start_matches('/'));
    Url::parse(&joined).map_err(|e| ApiError::invalid_config(format!("invalid request URL: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_keeps_base_path_prefix() {
        let base = Url::parse("https://zone1.example.com/rest/v1.0").unwrap();
        let url = join_url(&base, "/Tickets/42").unwrap();
        assert_eq!(url.as_str(), "https://zone1.example.com/rest/v1.0/Tickets/42");
    }

    #[test]
    fn error_message_reads_vendor_shape() {
        let body = serde_json::json!({ "errors": ["field X is required"] });
        assert_eq!(error_message(&body).as_deref(), Some("field X is required"));
        assert_eq!(error_message(&serde_json::json!({})), None);
    }

    #[test]
    fn retry_after_parses_seconds() {
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), "7".to_string());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
    }
}
