//! Zone management
//!
//! Holds the zone table (registration order preserved — it is the
//! selection tie-break), tracks per-zone health from request completions
//! and background health checks, resolves which zone a request should
//! target, and performs discovery-based auto-detection.
//!
//! Selection policy: highest-priority healthy non-backup zone wins; ties
//! go to the first registered; backups are only eligible when no
//! non-backup qualifies. Failover is per-request — every dispatch
//! re-evaluates this policy, so a recovered primary is re-adopted as soon
//! as its circuit permits probes again. The health task only updates
//! health; promoting another zone is the orchestrator's call.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use meridian_error::Result;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ZoneConfig;
use crate::transport::{ApiRequest, Transport};

/// How many recent completions feed the rolling failure rate.
const ROLLING_WINDOW: usize = 20;
/// Consecutive failures that mark a zone unhealthy outright.
const UNHEALTHY_AFTER: u32 = 3;

/// Zone health as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneHealth {
    /// Recent traffic or health checks succeeded.
    Healthy,
    /// Recent traffic or health checks failed.
    Unhealthy,
    /// No signal yet; eligible for selection.
    Unknown,
}

impl std::fmt::Display for ZoneHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug)]
struct ZoneState {
    config: ZoneConfig,
    health: ZoneHealth,
    total_requests: u64,
    failed_requests: u64,
    consecutive_failures: u32,
    recent: VecDeque<bool>,
    total_duration: Duration,
    last_health_check: Option<Instant>,
}

impl ZoneState {
    fn new(config: ZoneConfig) -> Self {
        Self {
            config,
            health: ZoneHealth::Unknown,
            total_requests: 0,
            failed_requests: 0,
            consecutive_failures: 0,
            recent: VecDeque::with_capacity(ROLLING_WINDOW),
            total_duration: Duration::ZERO,
            last_health_check: None,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|ok| !**ok).count();
        failures as f64 / self.recent.len() as f64
    }
}

/// Snapshot of one zone for the observability surface.
#[derive(Debug, Clone)]
pub struct ZoneStatistics {
    /// Zone id.
    pub zone_id: String,
    /// Human-readable name.
    pub name: String,
    /// Selection priority.
    pub priority: u8,
    /// Whether the zone is a backup.
    pub is_backup: bool,
    /// Current health.
    pub health: ZoneHealth,
    /// Completions recorded against the zone.
    pub total_requests: u64,
    /// Failed completions.
    pub failed_requests: u64,
    /// Failure rate over the rolling window.
    pub failure_rate: f64,
    /// Mean request duration.
    pub avg_duration: Duration,
}

/// Wire shape of the discovery endpoint's response.
#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    #[serde(rename = "zoneName")]
    zone_name: String,
    url: String,
}

/// Zone table, selection policy, discovery and health checking.
pub struct ZoneManager {
    zones: RwLock<Vec<ZoneState>>,
    transport: Arc<Transport>,
    discovery_url: Url,
    failure_rate_threshold: f64,
    health_task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl ZoneManager {
    /// Create a manager with an initial zone set.
    pub fn new(
        transport: Arc<Transport>,
        discovery_url: Url,
        failure_rate_threshold: f64,
        zones: &[ZoneConfig],
    ) -> Self {
        Self {
            zones: RwLock::new(zones.iter().cloned().map(ZoneState::new).collect()),
            transport,
            discovery_url,
            failure_rate_threshold,
            health_task: Mutex::new(None),
        }
    }

    /// Register a zone. Re-adding an existing id replaces its config but
    /// keeps its stats.
    pub fn add_zone(&self, config: ZoneConfig) {
        let mut zones = self.zones.write();
        if let Some(existing) = zones.iter_mut().find(|z| z.config.zone_id == config.zone_id) {
            existing.config = config;
        } else {
            info!(zone = %config.zone_id, priority = config.priority, backup = config.is_backup, "zone registered");
            zones.push(ZoneState::new(config));
        }
    }

    /// Remove a zone; returns whether it existed.
    pub fn remove_zone(&self, zone_id: &str) -> bool {
        let mut zones = self.zones.write();
        let before = zones.len();
        zones.retain(|z| z.config.zone_id != zone_id);
        zones.len() != before
    }

    /// All registered zone configs, in registration order.
    pub fn all_zones(&self) -> Vec<ZoneConfig> {
        self.zones.read().iter().map(|z| z.config.clone()).collect()
    }

    /// Number of zones not currently marked unhealthy.
    pub fn healthy_zone_count(&self) -> usize {
        self.zones
            .read()
            .iter()
            .filter(|z| z.health != ZoneHealth::Unhealthy)
            .count()
    }

    /// Total registered zones.
    pub fn zone_count(&self) -> usize {
        self.zones.read().len()
    }

    /// Whether any non-backup zone is still serviceable.
    pub fn primary_available(&self) -> bool {
        self.zones
            .read()
            .iter()
            .any(|z| !z.config.is_backup && z.health != ZoneHealth::Unhealthy)
    }

    /// Snapshot per-zone statistics.
    pub fn zone_statistics(&self) -> Vec<ZoneStatistics> {
        self.zones
            .read()
            .iter()
            .map(|z| ZoneStatistics {
                zone_id: z.config.zone_id.clone(),
                name: z.config.name.clone(),
                priority: z.config.priority,
                is_backup: z.config.is_backup,
                health: z.health,
                total_requests: z.total_requests,
                failed_requests: z.failed_requests,
                failure_rate: z.failure_rate(),
                avg_duration: if z.total_requests == 0 {
                    Duration::ZERO
                } else {
                    div_duration(z.total_duration, z.total_requests)
                },
            })
            .collect()
    }

    /// Select the zone a request should target.
    ///
    /// `preferred` is the caller's pinned zone and wins outright when it
    /// exists (a pinned request that hits an open circuit should fail
    /// fast there, not silently route elsewhere). `exclude` is the zone
    /// a failover is moving away from and is never returned. `is_blocked`
    /// answers whether the request's endpoint has an open circuit on a
    /// zone.
    ///
    /// Candidates are tried in quality tiers: healthy and unblocked
    /// first, then unblocked regardless of health, then anything left.
    /// The last tier keeps a degraded deployment routing to its best
    /// remaining zone — if that zone's circuit is open the breaker check
    /// fails the request fast, which is the signal the orchestrator
    /// needs, rather than an unroutable error. Within each tier the
    /// highest-priority non-backup zone wins, ties going to the first
    /// registered; backups are considered only when no non-backup
    /// qualifies.
    pub fn select_zone(
        &self,
        preferred: Option<&str>,
        exclude: Option<&str>,
        is_blocked: &dyn Fn(&str) -> bool,
    ) -> Option<ZoneConfig> {
        let zones = self.zones.read();

        if let Some(preferred) = preferred {
            if let Some(zone) = zones
                .iter()
                .filter(|z| Some(z.config.zone_id.as_str()) != exclude)
                .find(|z| z.config.zone_id == preferred)
            {
                return Some(zone.config.clone());
            }
        }

        // `>=` on the accumulator keeps the first-registered zone on
        // priority ties.
        let best = |tier: &dyn Fn(&ZoneState) -> bool, backup: bool| {
            zones
                .iter()
                .filter(|z| Some(z.config.zone_id.as_str()) != exclude)
                .filter(|z| tier(z))
                .filter(|z| z.config.is_backup == backup)
                .fold(None::<&ZoneState>, |best, z| match best {
                    Some(b) if b.config.priority >= z.config.priority => Some(b),
                    _ => Some(z),
                })
        };

        let tiers: [&dyn Fn(&ZoneState) -> bool; 3] = [
            &|z: &ZoneState| {
                z.health != ZoneHealth::Unhealthy && !is_blocked(&z.config.zone_id)
            },
            &|z: &ZoneState| !is_blocked(&z.config.zone_id),
            &|_: &ZoneState| true,
        ];
        tiers
            .iter()
            .find_map(|tier| best(tier, false).or_else(|| best(tier, true)))
            .map(|z| z.config.clone())
    }

    /// Select a failover target: a healthy, unblocked zone other than
    /// `exclude`, or nothing. Failover never lowers its standards the
    /// way initial routing does — moving a request to a zone that is
    /// already failing buys nothing.
    pub fn select_failover_zone(
        &self,
        exclude: &str,
        is_blocked: &dyn Fn(&str) -> bool,
    ) -> Option<ZoneConfig> {
        let zones = self.zones.read();
        let best = |backup: bool| {
            zones
                .iter()
                .filter(|z| z.config.zone_id != exclude)
                .filter(|z| z.health != ZoneHealth::Unhealthy && !is_blocked(&z.config.zone_id))
                .filter(|z| z.config.is_backup == backup)
                .fold(None::<&ZoneState>, |best, z| match best {
                    Some(b) if b.config.priority >= z.config.priority => Some(b),
                    _ => Some(z),
                })
        };
        best(false).or_else(|| best(true)).map(|z| z.config.clone())
    }

    /// Record a request completion against a zone.
    pub fn record_request_complete(
        &self,
        zone_id: &str,
        request_id: &str,
        success: bool,
        duration: Duration,
    ) {
        let mut zones = self.zones.write();
        let Some(zone) = zones.iter_mut().find(|z| z.config.zone_id == zone_id) else {
            return;
        };

        zone.total_requests += 1;
        zone.total_duration += duration;
        if zone.recent.len() == ROLLING_WINDOW {
            zone.recent.pop_front();
        }
        zone.recent.push_back(success);

        if success {
            zone.consecutive_failures = 0;
            zone.health = ZoneHealth::Healthy;
        } else {
            zone.failed_requests += 1;
            zone.consecutive_failures += 1;
            let rate = zone.failure_rate();
            if zone.consecutive_failures >= UNHEALTHY_AFTER || rate > self.failure_rate_threshold {
                if zone.health != ZoneHealth::Unhealthy {
                    warn!(
                        zone = zone_id,
                        request = request_id,
                        consecutive = zone.consecutive_failures,
                        failure_rate = rate,
                        "zone marked unhealthy"
                    );
                }
                zone.health = ZoneHealth::Unhealthy;
            }
        }
    }

    /// Resolve the zone owning `username` via the discovery endpoint.
    ///
    /// Failure is non-fatal: the caller falls back to manual zone
    /// configuration, so errors are logged and swallowed.
    pub async fn detect_zone(&self, username: &str) -> Option<ZoneConfig> {
        let request = ApiRequest::get("").with_query("user", username);
        let response = match self
            .transport
            .send_absolute(self.discovery_url.clone(), &request)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "zone auto-detection failed; falling back to configured zones");
                return None;
            }
        };

        let discovered: DiscoveryResponse = match response.json() {
            Ok(d) => d,
            Err(err) => {
                warn!(error = %err, "zone auto-detection returned an unexpected payload");
                return None;
            }
        };
        let api_url = match Url::parse(&discovered.url) {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, url = %discovered.url, "discovery returned an invalid zone URL");
                return None;
            }
        };

        info!(zone = %discovered.zone_name, url = %api_url, "zone auto-detected");
        Some(ZoneConfig::new(discovered.zone_name, api_url))
    }

    /// Run one health-check pass over every zone, updating health.
    ///
    /// A zone is reachable when the server answers at all — any HTTP
    /// status counts; only transport-level failures mark it unhealthy.
    pub async fn force_health_check(&self) {
        let targets: Vec<(String, Url)> = self
            .zones
            .read()
            .iter()
            .map(|z| (z.config.zone_id.clone(), z.config.api_url.clone()))
            .collect();

        for (zone_id, api_url) in targets {
            let probe = ApiRequest::get("");
            let reachable = match self.transport.send_absolute(api_url, &probe).await {
                Ok(_) => true,
                Err(err) => {
                    use meridian_error::ErrorKind;
                    !matches!(
                        err.kind(),
                        ErrorKind::NetworkTimeout { .. } | ErrorKind::ConnectionFailed { .. }
                    )
                }
            };

            let mut zones = self.zones.write();
            if let Some(zone) = zones.iter_mut().find(|z| z.config.zone_id == zone_id) {
                zone.last_health_check = Some(Instant::now());
                let health = if reachable {
                    ZoneHealth::Healthy
                } else {
                    ZoneHealth::Unhealthy
                };
                if health != zone.health {
                    debug!(zone = %zone_id, from = %zone.health, to = %health, "health check updated zone");
                }
                zone.health = health;
            }
        }
    }

    /// Start the periodic health-check task. The handle and its
    /// cancellation token are owned here and stopped in [`destroy`](Self::destroy).
    pub fn start_health_task(self: &Arc<Self>, interval: Duration) {
        let mut slot = self.health_task.lock();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let task_token = token.clone();
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so construction
            // does not race the caller's own setup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => manager.force_health_check().await,
                }
            }
        });
        *slot = Some((handle, token));
    }

    /// Stop the health task and release it. Idempotent.
    pub fn destroy(&self) {
        if let Some((handle, token)) = self.health_task.lock().take() {
            token.cancel();
            handle.abort();
        }
    }
}

impl Drop for ZoneManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn div_duration(total: Duration, count: u64) -> Duration {
    Duration::from_nanos((total.as_nanos() / u128::from(count)) as u64)
}
