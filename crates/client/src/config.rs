//! Client configuration
//!
//! Plain data structs with `with_*` builders and a `validate()` that runs
//! once, at client construction. Nothing here touches the network.

use std::fmt;
use std::time::Duration;

use meridian_error::{ApiError, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Default discovery endpoint used for zone auto-detection.
pub const DEFAULT_DISCOVERY_URL: &str =
    "https://webservices.meridianpsa.com/rest/v1.0/zoneInformation";

/// API credentials sent with every request.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Integration code identifying the calling application.
    pub api_integration_code: String,
    /// API user name; also the key for zone auto-detection.
    pub username: String,
    /// API secret.
    pub secret: String,
}

impl Credentials {
    /// Create a credential set.
    pub fn new(
        api_integration_code: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            api_integration_code: api_integration_code.into(),
            username: username.into(),
            secret: secret.into(),
        }
    }
}

// The secret must never end up in logs via {:?}.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_integration_code", &self.api_integration_code)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A region-specific API endpoint. Accounts are bound to exactly one
/// primary zone; additional zones act as failover targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Stable identity of the zone.
    pub zone_id: String,
    /// Human-readable name.
    pub name: String,
    /// Base URL all endpoint paths are joined onto.
    pub api_url: Url,
    /// Selection priority, 0–10; higher wins.
    pub priority: u8,
    /// Backup zones are only selected when no non-backup zone is eligible.
    pub is_backup: bool,
}

impl ZoneConfig {
    /// Create a zone with priority 10 (primary) and backup off.
    pub fn new(zone_id: impl Into<String>, api_url: Url) -> Self {
        let zone_id = zone_id.into();
        Self {
            name: zone_id.clone(),
            zone_id,
            api_url,
            priority: 10,
            is_backup: false,
        }
    }

    /// Set the human-readable name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the selection priority (0–10).
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Mark this zone as a backup.
    #[must_use]
    pub fn as_backup(mut self) -> Self {
        self.is_backup = true;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.zone_id.is_empty() {
            return Err(ApiError::invalid_config("zone_id must not be empty"));
        }
        if self.priority > 10 {
            return Err(ApiError::invalid_config(format!(
                "zone '{}': priority must be 0-10, got {}",
                self.zone_id, self.priority
            )));
        }
        Ok(())
    }
}

/// Rolling-window request budget per zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests permitted per window.
    pub max_requests: usize,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::conservative()
    }
}

impl RateLimitConfig {
    /// Conservative ceiling: 5 requests per second, well under the
    /// vendor's published limits.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(1),
        }
    }

    /// Production ceiling for accounts cleared for higher throughput.
    #[must_use]
    pub fn production() -> Self {
        Self {
            max_requests: 20,
            window: Duration::from_secs(1),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(ApiError::invalid_config("max_requests must be greater than 0"));
        }
        if self.window.is_zero() {
            return Err(ApiError::invalid_config("rate limit window must be greater than 0"));
        }
        Ok(())
    }
}

/// Retry behaviour for a single logical request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts including the first (1 = no retry).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Backoff multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Apply equal-jitter to computed delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Set the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ApiError::invalid_config("max_attempts must be greater than 0"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ApiError::invalid_config("backoff_multiplier must be at least 1.0"));
        }
        if self.max_delay < self.base_delay {
            return Err(ApiError::invalid_config("max_delay must not be below base_delay"));
        }
        Ok(())
    }
}

/// Breaker thresholds, shared by every (endpoint, zone) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time an open circuit waits before permitting a probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the consecutive-failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }

    /// Set the open-state cooldown.
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(ApiError::invalid_config("failure_threshold must be greater than 0"));
        }
        if self.cooldown.is_zero() {
            return Err(ApiError::invalid_config("cooldown must be greater than 0"));
        }
        Ok(())
    }
}

/// Queue admission and dispatch bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Pending requests beyond this are rejected outright.
    pub max_depth: usize,
    /// In-flight request ceiling.
    pub max_concurrency: usize,
    /// In degraded mode, requests below this priority are shed.
    pub degraded_priority_floor: u8,
    /// Timeout applied when request options leave it unset.
    pub default_timeout: Duration,
    /// Priority applied when request options leave it unset.
    pub default_priority: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 1000,
            max_concurrency: 10,
            degraded_priority_floor: 5,
            default_timeout: Duration::from_secs(30),
            default_priority: 5,
        }
    }
}

impl QueueConfig {
    /// Set the queue depth bound.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set the in-flight ceiling.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set the default per-request timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(ApiError::invalid_config("max_depth must be greater than 0"));
        }
        if self.max_concurrency == 0 {
            return Err(ApiError::invalid_config("max_concurrency must be greater than 0"));
        }
        if self.degraded_priority_floor > 10 || self.default_priority > 10 {
            return Err(ApiError::invalid_config("priorities must be 0-10"));
        }
        if self.default_timeout.is_zero() {
            return Err(ApiError::invalid_config("default_timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API credentials.
    pub credentials: Credentials,
    /// Discovery endpoint for zone auto-detection.
    pub discovery_url: Url,
    /// Zones registered at construction; more can be added later.
    pub zones: Vec<ZoneConfig>,
    /// Per-zone request budget.
    pub rate_limit: RateLimitConfig,
    /// Retry behaviour.
    pub retry: RetryConfig,
    /// Breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Queue bounds.
    pub queue: QueueConfig,
    /// Interval for the background zone health check; `None` disables it.
    pub health_check_interval: Option<Duration>,
    /// Rolling failure rate above which a zone is marked unhealthy.
    pub failure_rate_threshold: f64,
    /// Transport timeout for one HTTP attempt.
    pub request_timeout: Duration,
    /// `User-Agent` header value.
    pub user_agent: String,
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but credentials.
    ///
    /// # Panics
    ///
    /// Never panics: [`DEFAULT_DISCOVERY_URL`] is a valid URL.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            discovery_url: Url::parse(DEFAULT_DISCOVERY_URL).expect("default discovery URL"),
            zones: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            queue: QueueConfig::default(),
            health_check_interval: Some(Duration::from_secs(60)),
            failure_rate_threshold: 0.5,
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("meridian-client/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    /// Register a zone.
    #[must_use]
    pub fn with_zone(mut self, zone: ZoneConfig) -> Self {
        self.zones.push(zone);
        self
    }

    /// Override the discovery endpoint.
    #[must_use]
    pub fn with_discovery_url(mut self, discovery_url: Url) -> Self {
        self.discovery_url = discovery_url;
        self
    }

    /// Override the rate-limit budget.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Override retry behaviour.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override breaker thresholds.
    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Override queue bounds.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set the health-check interval, or disable the task with `None`.
    #[must_use]
    pub fn with_health_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Validate the whole configuration tree.
    pub fn validate(&self) -> Result<()> {
        if self.credentials.api_integration_code.is_empty()
            || self.credentials.username.is_empty()
            || self.credentials.secret.is_empty()
        {
            return Err(ApiError::invalid_config("credentials must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(ApiError::invalid_config(
                "failure_rate_threshold must be within 0.0-1.0",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ApiError::invalid_config("request_timeout must be greater than 0"));
        }
        for zone in &self.zones {
            zone.validate()?;
        }
        self.rate_limit.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.queue.validate()?;
        Ok(())
    }
}
