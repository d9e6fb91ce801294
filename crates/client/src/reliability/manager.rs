//! Reliability orchestration
//!
//! The manager owns the request queue and composes the rate limiter,
//! circuit registry, retry policy and zone manager around every outgoing
//! call. Requests are admitted under backpressure rules, dispatched by
//! priority under a concurrency bound, gated per attempt by the rate
//! limiter, executed with retry on a zone held stable for the whole
//! retry sequence, and failed over at most once to the next eligible
//! zone when a transient failure (or an open circuit) exhausts that
//! sequence.
//!
//! A request's own timeout bounds queue wait plus execution. Expiry
//! settles the caller's future early; an HTTP call already in flight is
//! never aborted, it just completes unobserved.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meridian_error::{ApiError, ErrorContext, ErrorKind, Result, Retryable};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{QueueConfig, ZoneConfig};
use crate::reliability::circuit::CircuitRegistry;
use crate::reliability::queue::{
    QueueStatistics, QueuedRequest, RequestEnvelope, RequestFn, RequestOptions, RequestQueue,
};
use crate::reliability::rate_limit::{RateLimitMetrics, RateLimiter};
use crate::reliability::retry::{RetryMetrics, RetryPolicy};
use crate::reliability::zone::ZoneManager;
use crate::transport::ApiResponse;

/// Aggregate health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Everything nominal.
    Healthy,
    /// Capability reduced: open circuits, degraded mode, or a filling queue.
    Degraded,
    /// Serving on backups only, or the queue is full.
    Critical,
    /// No eligible zone remains.
    Unavailable,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Point-in-time health snapshot, derived on demand.
#[derive(Debug, Clone)]
pub struct SystemHealth {
    /// Overall status.
    pub overall: HealthStatus,
    /// Zones not currently marked unhealthy.
    pub healthy_zones: usize,
    /// Registered zones.
    pub total_zones: usize,
    /// Circuits currently failing fast.
    pub open_circuits: usize,
    /// Requests waiting for dispatch.
    pub queue_depth: usize,
    /// Whether degraded mode is engaged.
    pub degraded_mode: bool,
}

/// Cumulative request counters.
#[derive(Debug, Clone)]
pub struct ReliabilityMetrics {
    /// Requests settled (success or failure).
    pub total_requests: u64,
    /// Requests that succeeded.
    pub successes: u64,
    /// Requests that failed.
    pub failures: u64,
    /// Success percentage over settled requests.
    pub availability: f64,
    /// Mean time from enqueue to dispatch.
    pub average_queue_wait: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successes: u64,
    failures: u64,
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: u64,
    dispatched: u64,
    rejected: u64,
    expired: u64,
    total_wait: Duration,
    waited: u64,
}

struct Shared {
    queue_config: QueueConfig,
    queue: Mutex<RequestQueue>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    limiter: Arc<RateLimiter>,
    retry: Arc<RetryPolicy>,
    circuits: Arc<CircuitRegistry>,
    zones: Arc<ZoneManager>,
    counters: Mutex<Counters>,
    queue_counters: Mutex<QueueCounters>,
    degraded: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

/// Orchestrator for every outbound call.
pub struct ReliabilityManager {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ReliabilityManager {
    /// Wire the manager from its injected components.
    ///
    /// The dispatcher task starts lazily on the first queued request, so
    /// construction itself does not need a runtime.
    pub fn new(
        limiter: Arc<RateLimiter>,
        retry: Arc<RetryPolicy>,
        circuits: Arc<CircuitRegistry>,
        zones: Arc<ZoneManager>,
        queue_config: QueueConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(queue_config.max_concurrency));
        Self {
            shared: Arc::new(Shared {
                queue_config,
                queue: Mutex::new(RequestQueue::default()),
                notify: Notify::new(),
                semaphore,
                limiter,
                retry,
                circuits,
                zones,
                counters: Mutex::new(Counters::default()),
                queue_counters: Mutex::new(QueueCounters::default()),
                degraded: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    fn ensure_dispatcher(&self) {
        let mut slot = self.dispatcher.lock();
        if slot.is_none() && !self.shared.shutdown.is_cancelled() {
            let shared = Arc::clone(&self.shared);
            *slot = Some(tokio::spawn(dispatch_loop(shared)));
        }
    }

    /// Queue a request for dispatch and await its outcome.
    ///
    /// `zone` pins the request to a zone when given; otherwise the zone
    /// manager's selection policy decides at dispatch time.
    pub async fn queue_request(
        &self,
        endpoint: &str,
        method: &str,
        zone: Option<String>,
        operation: RequestFn,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        self.ensure_dispatcher();

        let timeout_budget = options
            .timeout
            .unwrap_or(self.shared.queue_config.default_timeout);
        let envelope = RequestEnvelope {
            id: Uuid::new_v4().to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            zone,
            priority: options.priority.min(10),
            timeout: timeout_budget,
            retryable: options.retryable,
            metadata: options.metadata,
            enqueued_at: Instant::now(),
            operation,
        };

        // Context for failures that settle on the caller's side of the
        // channel, after the envelope has moved into the queue.
        let request_id = envelope.id.clone();
        let caller_metadata = envelope.metadata.clone();
        let caller_context = move || {
            let mut context = ErrorContext::new(endpoint, method).with_request_id(request_id);
            for (key, value) in &caller_metadata {
                context = context.with_metadata(key.as_str(), value.as_str());
            }
            context
        };

        let (tx, rx) = oneshot::channel();
        {
            if self.shared.shutdown.is_cancelled() {
                return Err(self.settle_failure(reject(&envelope, "client destroyed")));
            }
            let degraded = self.shared.degraded.lock().clone();
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.queue_config.max_depth {
                self.shared.queue_counters.lock().rejected += 1;
                return Err(self.settle_failure(reject(&envelope, "queue full")));
            }
            if let Some(reason) = degraded {
                if envelope.priority < self.shared.queue_config.degraded_priority_floor {
                    self.shared.queue_counters.lock().rejected += 1;
                    return Err(
                        self.settle_failure(reject(&envelope, &format!("degraded mode: {reason}")))
                    );
                }
            }
            self.shared.queue_counters.lock().enqueued += 1;
            queue.push(envelope, tx);
        }
        self.shared.notify.notify_one();

        match tokio::time::timeout(timeout_budget, rx).await {
            Ok(Ok(result)) => self.settle(result),
            Ok(Err(_)) => self.settle(Err(
                ApiError::unknown("request dropped before completion").with_context(caller_context())
            )),
            Err(_) => {
                self.shared.queue_counters.lock().expired += 1;
                self.settle(Err(
                    ApiError::queue_timeout(timeout_budget).with_context(caller_context())
                ))
            }
        }
    }

    /// Execute a request immediately, bypassing queue admission.
    ///
    /// Still bounded by the concurrency ceiling and runs the full
    /// rate-limit → circuit → retry → failover pipeline.
    pub async fn execute_request(
        &self,
        operation: RequestFn,
        endpoint: &str,
        method: &str,
        zone: Option<String>,
        metadata: std::collections::HashMap<String, String>,
    ) -> Result<ApiResponse> {
        let timeout_budget = self.shared.queue_config.default_timeout;
        let envelope = RequestEnvelope {
            id: Uuid::new_v4().to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            zone,
            priority: 10,
            timeout: timeout_budget,
            retryable: true,
            metadata,
            enqueued_at: Instant::now(),
            operation,
        };

        if self.shared.shutdown.is_cancelled() {
            return Err(self.settle_failure(reject(&envelope, "client destroyed")));
        }

        let shared = Arc::clone(&self.shared);
        let result = tokio::time::timeout(timeout_budget, async {
            let _permit = shared
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| reject(&envelope, "client destroyed"))?;
            execute_pipeline(&shared, &envelope).await
        })
        .await
        .unwrap_or_else(|_| Err(ApiError::queue_timeout(timeout_budget)));

        self.settle(attach_context(result, &envelope, None))
    }

    /// Record a settled outcome in the cumulative counters.
    fn settle(&self, result: Result<ApiResponse>) -> Result<ApiResponse> {
        let mut counters = self.shared.counters.lock();
        counters.total += 1;
        match &result {
            Ok(_) => counters.successes += 1,
            Err(_) => counters.failures += 1,
        }
        result
    }

    /// Record a failure the request never got past admission for.
    fn settle_failure(&self, error: ApiError) -> ApiError {
        let mut counters = self.shared.counters.lock();
        counters.total += 1;
        counters.failures += 1;
        error
    }

    /// Derive the aggregate health snapshot.
    pub fn system_health(&self) -> SystemHealth {
        let total_zones = self.shared.zones.zone_count();
        let healthy_zones = self.shared.zones.healthy_zone_count();
        let open_circuits = self.shared.circuits.open_circuits();
        let queue_depth = self.shared.queue.lock().len();
        let degraded_mode = self.shared.degraded.lock().is_some();
        let max_depth = self.shared.queue_config.max_depth;

        let overall = if total_zones == 0 || healthy_zones == 0 {
            HealthStatus::Unavailable
        } else if queue_depth >= max_depth || !self.shared.zones.primary_available() {
            HealthStatus::Critical
        } else if degraded_mode || open_circuits > 0 || queue_depth >= max_depth / 2 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SystemHealth {
            overall,
            healthy_zones,
            total_zones,
            open_circuits,
            queue_depth,
            degraded_mode,
        }
    }

    /// Snapshot cumulative request counters.
    pub fn metrics(&self) -> ReliabilityMetrics {
        let counters = self.shared.counters.lock();
        let queue_counters = self.shared.queue_counters.lock();
        ReliabilityMetrics {
            total_requests: counters.total,
            successes: counters.successes,
            failures: counters.failures,
            availability: if counters.total == 0 {
                100.0
            } else {
                counters.successes as f64 / counters.total as f64 * 100.0
            },
            average_queue_wait: if queue_counters.waited == 0 {
                Duration::ZERO
            } else {
                queue_counters.total_wait / queue_counters.waited as u32
            },
        }
    }

    /// Snapshot retry counters.
    pub fn retry_metrics(&self) -> RetryMetrics {
        self.shared.retry.metrics()
    }

    /// Snapshot rate-limit counters.
    pub fn rate_limit_metrics(&self) -> RateLimitMetrics {
        self.shared.limiter.metrics()
    }

    /// Snapshot queue activity.
    pub fn queue_statistics(&self) -> QueueStatistics {
        let queue_counters = self.shared.queue_counters.lock();
        let max = self.shared.queue_config.max_concurrency;
        QueueStatistics {
            depth: self.shared.queue.lock().len(),
            in_flight: max.saturating_sub(self.shared.semaphore.available_permits()),
            total_enqueued: queue_counters.enqueued,
            total_dispatched: queue_counters.dispatched,
            total_rejected: queue_counters.rejected,
            total_expired: queue_counters.expired,
            average_wait: if queue_counters.waited == 0 {
                Duration::ZERO
            } else {
                queue_counters.total_wait / queue_counters.waited as u32
            },
            degraded_mode: self.shared.degraded.lock().is_some(),
        }
    }

    /// Engage or release degraded mode. While engaged, requests below the
    /// configured priority floor are shed at admission.
    pub fn set_degraded_mode(&self, enabled: bool, reason: Option<&str>) {
        let mut degraded = self.shared.degraded.lock();
        if enabled {
            let reason = reason.unwrap_or("unspecified").to_string();
            info!(reason = %reason, "degraded mode engaged");
            *degraded = Some(reason);
        } else {
            if degraded.is_some() {
                info!("degraded mode released");
            }
            *degraded = None;
        }
    }

    /// Reject pending requests.
    ///
    /// With `force`, everything pending is rejected (the shutdown path);
    /// without it, only entries whose timeout has already expired are
    /// dropped. Returns how many were rejected; afterwards the queue
    /// depth is zero when forced.
    pub fn clear_queue(&self, force: bool) -> usize {
        let drained = {
            let mut queue = self.shared.queue.lock();
            let drained = queue.drain();
            if !force {
                // Put the still-valid entries back, order preserved by seq.
                let (expired, keep): (Vec<_>, Vec<_>) = drained
                    .into_iter()
                    .partition(|q| q.envelope.enqueued_at.elapsed() >= q.envelope.timeout);
                for entry in keep {
                    queue.requeue(entry);
                }
                expired
            } else {
                drained
            }
        };

        let count = drained.len();
        if count > 0 {
            warn!(count, force, "clearing queued requests");
        }
        let mut delivered = 0u64;
        for entry in drained {
            let elapsed = entry.envelope.enqueued_at.elapsed();
            let error = if force {
                reject(&entry.envelope, "queue cleared")
            } else {
                contextualize(ApiError::queue_timeout(elapsed), &entry.envelope, None)
            };
            if entry.reply.send(Err(error)).is_ok() {
                delivered += 1;
            }
        }
        {
            let mut queue_counters = self.shared.queue_counters.lock();
            if force {
                queue_counters.rejected += delivered;
            } else {
                queue_counters.expired += delivered;
            }
        }
        count
    }

    /// Stop the dispatcher, clear the queue and release all per-zone and
    /// per-circuit state. Idempotent; required for clean shutdown and
    /// test isolation.
    pub fn destroy(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        debug!("reliability manager shutting down");
        self.shared.shutdown.cancel();
        self.shared.notify.notify_one();
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        self.clear_queue(true);
        self.shared.circuits.clear();
        self.shared.zones.destroy();
        self.shared.semaphore.close();
    }
}

impl Drop for ReliabilityManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn reject(envelope: &RequestEnvelope, reason: &str) -> ApiError {
    contextualize(ApiError::queue_overloaded(reason), envelope, None)
}

fn context_for(envelope: &RequestEnvelope, zone: Option<&str>) -> ErrorContext {
    let mut context = ErrorContext::new(envelope.endpoint.as_str(), envelope.method.as_str())
        .with_request_id(envelope.id.as_str());
    if let Some(zone) = zone {
        context = context.with_zone(zone);
    }
    for (key, value) in &envelope.metadata {
        context = context.with_metadata(key.as_str(), value.as_str());
    }
    context
}

fn contextualize(err: ApiError, envelope: &RequestEnvelope, zone: Option<&str>) -> ApiError {
    if err.context.is_none() {
        err.with_context(context_for(envelope, zone))
    } else {
        err
    }
}

fn attach_context(
    result: Result<ApiResponse>,
    envelope: &RequestEnvelope,
    zone: Option<&str>,
) -> Result<ApiResponse> {
    result.map_err(|err| contextualize(err, envelope, zone))
}

async fn dispatch_loop(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => break,
            () = shared.notify.notified() => {}
        }

        'drain: loop {
            if shared.shutdown.is_cancelled() {
                return;
            }
            let permit = tokio::select! {
                () = shared.shutdown.cancelled() => return,
                permit = shared.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let Some(queued) = shared.queue.lock().pop() else {
                drop(permit);
                break 'drain;
            };

            let waited = queued.envelope.enqueued_at.elapsed();
            if waited >= queued.envelope.timeout {
                // Expired while queued. The caller usually noticed first;
                // only count it here when this side settles the channel.
                let error = contextualize(ApiError::queue_timeout(waited), &queued.envelope, None);
                if queued.reply.send(Err(error)).is_ok() {
                    shared.queue_counters.lock().expired += 1;
                }
                drop(permit);
                continue;
            }

            {
                let mut queue_counters = shared.queue_counters.lock();
                queue_counters.dispatched += 1;
                queue_counters.total_wait += waited;
                queue_counters.waited += 1;
            }

            let shared_task = Arc::clone(&shared);
            tokio::spawn(async move {
                let QueuedRequest {
                    envelope, reply, ..
                } = queued;
                let result = execute_pipeline(&shared_task, &envelope).await;
                let _ = reply.send(result);
                drop(permit);
            });
        }
    }
}

/// Run one logical request: resolve a zone, execute the retry sequence
/// there, and fail over at most once when that sequence exhausts on a
/// transient failure or hits an open circuit.
async fn execute_pipeline(shared: &Arc<Shared>, envelope: &RequestEnvelope) -> Result<ApiResponse> {
    let blocked = |zone_id: &str| shared.circuits.is_open(&envelope.endpoint, zone_id);

    let Some(zone) = shared
        .zones
        .select_zone(envelope.zone.as_deref(), None, &blocked)
    else {
        return attach_context(
            Err(ApiError::connection_failed("no eligible zone available")),
            envelope,
            None,
        );
    };

    let first = execute_on_zone(shared, envelope, &zone).await;
    let error = match first {
        Ok(response) => return Ok(response),
        Err(error) => error,
    };

    let failover_worthy =
        error.is_retryable() || matches!(error.kind(), ErrorKind::CircuitOpen { .. });
    if envelope.retryable && failover_worthy {
        if let Some(alternate) = shared.zones.select_failover_zone(&zone.zone_id, &blocked) {
            warn!(
                endpoint = %envelope.endpoint,
                from = %zone.zone_id,
                to = %alternate.zone_id,
                "failing over to alternate zone"
            );
            return execute_on_zone(shared, envelope, &alternate).await;
        }
    }
    Err(error)
}

/// Execute the retry sequence against one zone. Every attempt passes the
/// rate-limit gate (and is recorded against the zone's bucket) before the
/// HTTP call; completions feed the zone's rolling stats.
async fn execute_on_zone(
    shared: &Arc<Shared>,
    envelope: &RequestEnvelope,
    zone: &ZoneConfig,
) -> Result<ApiResponse> {
    let deadline = envelope.enqueued_at + envelope.timeout;
    let zone_id = zone.zone_id.clone();

    let result = shared
        .retry
        .execute(&shared.circuits, &envelope.endpoint, &zone_id, || {
            let operation = Arc::clone(&envelope.operation);
            let api_url = zone.api_url.clone();
            let zone_id = zone_id.clone();
            let request_id = envelope.id.clone();
            let enqueued_at = envelope.enqueued_at;
            let shared = Arc::clone(shared);
            async move {
                loop {
                    let decision = shared.limiter.acquire(&zone_id);
                    if decision.allowed {
                        break;
                    }
                    if Instant::now() + decision.wait >= deadline {
                        return Err(ApiError::queue_timeout(enqueued_at.elapsed()));
                    }
                    debug!(
                        zone = %zone_id,
                        wait_ms = decision.wait.as_millis() as u64,
                        "rate limited; delaying attempt"
                    );
                    sleep(decision.wait).await;
                }
                shared.limiter.record_request(&zone_id);

                let started = Instant::now();
                let result = operation(api_url).await;
                shared.zones.record_request_complete(
                    &zone_id,
                    &request_id,
                    result.is_ok(),
                    started.elapsed(),
                );
                result
            }
        })
        .await;

    attach_context(result, envelope, Some(&zone_id))
}
