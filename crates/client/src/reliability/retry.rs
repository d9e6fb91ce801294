//! Retry with exponential backoff
//!
//! Wraps one logical request: sequential attempts, never concurrent, all
//! against the same zone. Only kinds the taxonomy marks retryable consume
//! an attempt; a `retry_after` hint on the error (429) overrides the
//! computed backoff. Every attempt is recorded on the breaker for its
//! (endpoint, zone) key, and an open circuit fails the whole execution
//! fast so the orchestrator can consider failover instead of waiting.

use std::future::Future;
use std::time::Duration;

use meridian_error::{Result, Retryable};
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::reliability::circuit::CircuitRegistry;

#[derive(Debug, Default, Clone)]
struct RetryCounters {
    total_attempts: u64,
    retried_requests: u64,
    exhausted: u64,
}

/// Snapshot of retry activity since construction.
#[derive(Debug, Clone)]
pub struct RetryMetrics {
    /// Attempts made, including first attempts.
    pub total_attempts: u64,
    /// Logical requests that needed at least one retry.
    pub retried_requests: u64,
    /// Logical requests that ran out of attempts.
    pub exhausted_retries: u64,
}

/// Backoff-and-retry executor for one logical request at a time.
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    counters: Mutex<RetryCounters>,
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(RetryCounters::default()),
        }
    }

    /// Delay before the retry following `attempt` (1-based).
    ///
    /// `hint` is the error's own `retry_after`, which wins over the
    /// computed backoff when present.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.config.max_delay);
        }
        let exp = self.config.base_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = (exp as u64).min(self.config.max_delay.as_millis() as u64);
        if self.config.jitter {
            // Equal jitter: half fixed, half random.
            let half = capped / 2;
            Duration::from_millis(half + fastrand::u64(0..=half))
        } else {
            Duration::from_millis(capped)
        }
    }

    /// Execute `op` with retry, recording each attempt on the breaker for
    /// `(endpoint, zone)`.
    pub async fn execute<T, F, Fut>(
        &self,
        circuits: &CircuitRegistry,
        endpoint: &str,
        zone: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            circuits.check(endpoint, zone)?;

            self.counters.lock().total_attempts += 1;
            match op().await {
                Ok(value) => {
                    circuits.record_success(endpoint, zone);
                    if attempt > 1 {
                        debug!(endpoint, zone, attempt, "request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    // Queue-level expiry is not a zone failure; do not let it
                    // trip the breaker.
                    if !matches!(error.kind(), meridian_error::ErrorKind::QueueTimeout { .. }) {
                        circuits.record_failure(endpoint, zone);
                    }

                    if !error.is_retryable() {
                        return Err(error);
                    }
                    if attempt >= self.config.max_attempts {
                        let mut counters = self.counters.lock();
                        counters.exhausted += 1;
                        warn!(
                            endpoint,
                            zone,
                            attempts = attempt,
                            "retries exhausted"
                        );
                        return Err(error);
                    }

                    let delay = self.delay_for_attempt(attempt, error.retry_after());
                    if attempt == 1 {
                        self.counters.lock().retried_requests += 1;
                    }
                    debug!(
                        endpoint,
                        zone,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after delay"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Snapshot retry counters.
    pub fn metrics(&self) -> RetryMetrics {
        let counters = self.counters.lock().clone();
        RetryMetrics {
            total_attempts: counters.total_attempts,
            retried_requests: counters.retried_requests,
            exhausted_retries: counters.exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use meridian_error::{ApiError, ErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::default()
                .with_max_attempts(max_attempts)
                .with_base_delay(Duration::from_millis(5))
                .with_jitter(false),
        )
    }

    fn circuits() -> CircuitRegistry {
        CircuitRegistry::new(CircuitBreakerConfig::default())
    }

    #[tokio::test]
    async fn succeeds_on_nth_attempt_within_budget() {
        let policy = policy(3);
        let reg = circuits();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let result = policy
            .execute(&reg, "/Tickets", "a", || {
                let calls = calls_op.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ApiError::server_error(502))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let metrics = policy.metrics();
        assert_eq!(metrics.total_attempts, 3);
        assert_eq!(metrics.retried_requests, 1);
        assert_eq!(metrics.exhausted_retries, 0);
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let policy = policy(3);
        let reg = circuits();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let result: Result<()> = policy
            .execute(&reg, "/Tickets", "a", || {
                let calls = calls_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::validation_failed(422, "bad field"))
                }
            })
            .await;

        assert!(matches!(
            result.unwrap_err().kind(),
            ErrorKind::ValidationFailed { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn never_exceeds_max_attempts() {
        let policy = policy(4);
        let reg = circuits();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let result: Result<()> = policy
            .execute(&reg, "/Tickets", "a", || {
                let calls = calls_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::server_error(500))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(policy.metrics().exhausted_retries, 1);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_an_attempt() {
        let policy = policy(3);
        let reg = CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
        });
        reg.record_failure("/Tickets", "a");

        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();
        let result: Result<()> = policy
            .execute(&reg, "/Tickets", "a", || {
                let calls = calls_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(
            result.unwrap_err().kind(),
            ErrorKind::CircuitOpen { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_millis(350))
                .with_jitter(false),
        );
        assert_eq!(policy.delay_for_attempt(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3, None), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_hint_overrides_backoff() {
        let policy = policy(3);
        assert_eq!(
            policy.delay_for_attempt(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn jitter_stays_within_equal_jitter_bounds() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_base_delay(Duration::from_millis(100))
                .with_jitter(true),
        );
        for _ in 0..32 {
            let delay = policy.delay_for_attempt(1, None);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }
}
