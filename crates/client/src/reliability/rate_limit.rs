//! Per-zone rate limiting
//!
//! Sliding-window counters over request instants, one bucket per zone.
//! The limiter is purely advisory: `acquire` answers "may this go now,
//! and if not, how long until it may" without ever sleeping; the
//! orchestrator owns the actual delay. Unregistered zones share one
//! fallback bucket so an unconfigured zone degrades instead of erroring.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Outcome of an advisory rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether a request may be issued now.
    pub allowed: bool,
    /// When not allowed, how long until the window has room again.
    pub wait: Duration,
}

#[derive(Debug, Default)]
struct Bucket {
    hits: VecDeque<Instant>,
    recorded: u64,
    throttled: u64,
}

impl Bucket {
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&front) = self.hits.front() {
            if now.duration_since(front) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn decide(&mut self, ceiling: usize, window: Duration) -> RateDecision {
        let now = Instant::now();
        self.prune(window, now);
        if self.hits.len() < ceiling {
            RateDecision {
                allowed: true,
                wait: Duration::ZERO,
            }
        } else {
            // Room opens when the oldest hit leaves the window.
            let wait = self
                .hits
                .front()
                .map_or(Duration::from_millis(1), |&oldest| {
                    window.saturating_sub(now.duration_since(oldest)).max(Duration::from_millis(1))
                });
            self.throttled += 1;
            RateDecision {
                allowed: false,
                wait,
            }
        }
    }

    fn record(&mut self, window: Duration) {
        let now = Instant::now();
        self.prune(window, now);
        self.hits.push_back(now);
        self.recorded += 1;
    }
}

/// Snapshot of one zone's rate-limit counters.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneRateLimitMetrics {
    /// Requests recorded since construction.
    pub recorded: u64,
    /// `acquire` calls answered "wait".
    pub throttled: u64,
    /// Requests currently inside the window.
    pub in_window: usize,
}

/// Snapshot of all rate-limit counters.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitMetrics {
    /// Requests recorded across all buckets.
    pub total_recorded: u64,
    /// `acquire` calls answered "wait" across all buckets.
    pub total_throttled: u64,
    /// Configured per-window ceiling.
    pub ceiling: usize,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Per-zone counters; the shared fallback bucket appears as `*`.
    pub zones: HashMap<String, ZoneRateLimitMetrics>,
}

/// Advisory sliding-window rate limiter with one bucket per zone.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
    fallback: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter with the given budget.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            fallback: Mutex::new(Bucket::default()),
        }
    }

    /// Register a zone so it gets a bucket of its own.
    pub fn register_zone(&self, zone_id: &str) {
        let mut buckets = self.buckets.lock();
        if !buckets.contains_key(zone_id) {
            debug!(zone = zone_id, "rate limit bucket registered");
            buckets.insert(zone_id.to_string(), Bucket::default());
        }
    }

    /// Drop a zone's bucket.
    pub fn remove_zone(&self, zone_id: &str) {
        self.buckets.lock().remove(zone_id);
    }

    /// May a request against `zone_id` be issued now?
    pub fn acquire(&self, zone_id: &str) -> RateDecision {
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(zone_id) {
            Some(bucket) => bucket.decide(self.config.max_requests, self.config.window),
            None => {
                drop(buckets);
                self.fallback
                    .lock()
                    .decide(self.config.max_requests, self.config.window)
            }
        }
    }

    /// Count a request that is about to be issued against `zone_id`.
    pub fn record_request(&self, zone_id: &str) {
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(zone_id) {
            Some(bucket) => bucket.record(self.config.window),
            None => {
                drop(buckets);
                self.fallback.lock().record(self.config.window);
            }
        }
    }

    /// Snapshot all counters.
    pub fn metrics(&self) -> RateLimitMetrics {
        let buckets = self.buckets.lock();
        let fallback = self.fallback.lock();

        let mut zones: HashMap<String, ZoneRateLimitMetrics> = buckets
            .iter()
            .map(|(id, b)| {
                (
                    id.clone(),
                    ZoneRateLimitMetrics {
                        recorded: b.recorded,
                        throttled: b.throttled,
                        in_window: b.hits.len(),
                    },
                )
            })
            .collect();
        if fallback.recorded > 0 || fallback.throttled > 0 {
            zones.insert(
                "*".to_string(),
                ZoneRateLimitMetrics {
                    recorded: fallback.recorded,
                    throttled: fallback.throttled,
                    in_window: fallback.hits.len(),
                },
            );
        }

        RateLimitMetrics {
            total_recorded: buckets.values().map(|b| b.recorded).sum::<u64>() + fallback.recorded,
            total_throttled: buckets.values().map(|b| b.throttled).sum::<u64>()
                + fallback.throttled,
            ceiling: self.config.max_requests,
            window_ms: self.config.window.as_millis() as u64,
            zones,
        }
    }
}
