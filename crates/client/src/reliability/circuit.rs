//! Circuit breaking per (endpoint, zone)
//!
//! Each key gets its own breaker: Closed until `failure_threshold`
//! consecutive failures, then Open (fail fast, no network attempt) until
//! the cooldown elapses, then HalfOpen where the next attempt decides —
//! success closes, failure re-opens and the cooldown restarts.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use meridian_error::{ApiError, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::CircuitBreakerConfig;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Operations flow normally.
    Closed,
    /// Operations fail fast.
    Open,
    /// One probe decides whether to close or re-open.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Key identifying one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    /// Endpoint root, e.g. `/Tickets`.
    pub endpoint: String,
    /// Zone id.
    pub zone: String,
}

impl CircuitKey {
    fn new(endpoint: &str, zone: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            zone: zone.to_string(),
        }
    }
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.endpoint, self.zone)
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    fn check(&mut self, config: &CircuitBreakerConfig, key: &CircuitKey) -> Result<()> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = self.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
                if elapsed >= config.cooldown {
                    self.state = CircuitState::HalfOpen;
                    debug!(key = %key, "circuit transitioning to half-open for probe");
                    Ok(())
                } else {
                    Err(ApiError::circuit_open(Some(config.cooldown - elapsed)))
                }
            }
        }
    }

    fn record_success(&mut self, key: &CircuitKey) {
        if self.state == CircuitState::HalfOpen {
            debug!(key = %key, "circuit closed after successful probe");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    fn record_failure(&mut self, config: &CircuitBreakerConfig, key: &CircuitKey) {
        self.consecutive_failures += 1;
        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= config.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                    warn!(
                        key = %key,
                        failures = self.consecutive_failures,
                        threshold = config.failure_threshold,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                warn!(key = %key, "circuit re-opened after failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Open and still within cooldown, i.e. a request now would fail fast.
    fn is_blocking(&self, config: &CircuitBreakerConfig) -> bool {
        self.state == CircuitState::Open
            && self.opened_at.is_some_and(|t| t.elapsed() < config.cooldown)
    }
}

/// Snapshot of one breaker.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// The (endpoint, zone) key.
    pub key: CircuitKey,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures recorded.
    pub consecutive_failures: u32,
    /// Time until an open circuit permits a probe.
    pub retry_in: Option<Duration>,
}

/// All breakers, keyed by (endpoint, zone).
#[derive(Debug)]
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<CircuitKey, Breaker>>,
}

impl CircuitRegistry {
    /// Create a registry; breakers materialize lazily per key.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Fail fast when the key's circuit is open; may transition Open →
    /// HalfOpen when the cooldown has elapsed.
    pub fn check(&self, endpoint: &str, zone: &str) -> Result<()> {
        let key = CircuitKey::new(endpoint, zone);
        let mut breakers = self.breakers.lock();
        breakers
            .entry(key.clone())
            .or_insert_with(Breaker::new)
            .check(&self.config, &key)
    }

    /// Record a successful attempt for the key.
    pub fn record_success(&self, endpoint: &str, zone: &str) {
        let key = CircuitKey::new(endpoint, zone);
        let mut breakers = self.breakers.lock();
        breakers
            .entry(key.clone())
            .or_insert_with(Breaker::new)
            .record_success(&key);
    }

    /// Record a failed attempt for the key.
    pub fn record_failure(&self, endpoint: &str, zone: &str) {
        let key = CircuitKey::new(endpoint, zone);
        let mut breakers = self.breakers.lock();
        breakers
            .entry(key.clone())
            .or_insert_with(Breaker::new)
            .record_failure(&self.config, &key);
    }

    /// Whether a request against the key would fail fast right now.
    ///
    /// Unlike [`check`](Self::check) this never transitions state, so zone
    /// selection can consult it without consuming the half-open probe.
    pub fn is_open(&self, endpoint: &str, zone: &str) -> bool {
        let key = CircuitKey::new(endpoint, zone);
        self.breakers
            .lock()
            .get(&key)
            .is_some_and(|b| b.is_blocking(&self.config))
    }

    /// Number of keys currently failing fast.
    pub fn open_circuits(&self) -> usize {
        self.breakers
            .lock()
            .values()
            .filter(|b| b.is_blocking(&self.config))
            .count()
    }

    /// Snapshot every breaker.
    pub fn stats(&self) -> Vec<CircuitStats> {
        self.breakers
            .lock()
            .iter()
            .map(|(key, b)| CircuitStats {
                key: key.clone(),
                state: b.state,
                consecutive_failures: b.consecutive_failures,
                retry_in: b.opened_at.and_then(|t| {
                    (b.state == CircuitState::Open)
                        .then(|| self.config.cooldown.saturating_sub(t.elapsed()))
                }),
            })
            .collect()
    }

    /// Drop all breaker state.
    pub fn clear(&self) {
        self.breakers.lock().clear();
    }
}
