//! Client facade
//!
//! Constructs and wires every component explicitly — transport, rate
//! limiter, retry policy, circuit registry, zone manager, reliability
//! manager — and hands out [`EntityHandle`]s implementing the uniform
//! request contract the generated entity layer calls into. Every
//! outbound call routes through the reliability manager's queue.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use meridian_error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::{ClientConfig, ZoneConfig};
use crate::filter::Query;
use crate::reliability::circuit::CircuitRegistry;
use crate::reliability::manager::{ReliabilityManager, ReliabilityMetrics, SystemHealth};
use crate::reliability::queue::{QueueStatistics, RequestFn, RequestOptions};
use crate::reliability::rate_limit::{RateLimitMetrics, RateLimiter};
use crate::reliability::retry::{RetryMetrics, RetryPolicy};
use crate::reliability::zone::{ZoneManager, ZoneStatistics};
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// Envelope for single-item responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemResponse<T> {
    /// The requested item.
    pub item: T,
}

/// Envelope for query responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsResponse<T> {
    /// Matching items for the requested page.
    pub items: Vec<T>,
    /// Paging details, when the server included them.
    #[serde(default)]
    pub page_details: Option<PageDetails>,
}

/// Paging envelope on query responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDetails {
    /// Total matching records.
    pub count: i64,
    /// Records in this page.
    pub request_count: i64,
    /// URL of the next page, when one exists.
    #[serde(default)]
    pub next_page_url: Option<String>,
}

/// Envelope for create/update/patch responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    /// Id of the written item, when the server returned one.
    #[serde(default)]
    pub item_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct QueryCountResponse {
    #[serde(rename = "queryCount")]
    query_count: i64,
}

struct ClientInner {
    username: String,
    transport: Arc<Transport>,
    limiter: Arc<RateLimiter>,
    zones: Arc<ZoneManager>,
    manager: ReliabilityManager,
}

/// The client: entry point for entity operations and observability.
///
/// Cheap to clone; all clones share the same reliability state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Validate `config` and wire the client.
    ///
    /// The zone health-check task starts only when a Tokio runtime is
    /// current; outside a runtime the client still works, without
    /// background health polling.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let transport = Arc::new(Transport::new(&config)?);
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let zones = Arc::new(ZoneManager::new(
            Arc::clone(&transport),
            config.discovery_url.clone(),
            config.failure_rate_threshold,
            &config.zones,
        ));
        for zone in &config.zones {
            limiter.register_zone(&zone.zone_id);
        }
        let retry = Arc::new(RetryPolicy::new(config.retry.clone()));
        let circuits = Arc::new(CircuitRegistry::new(config.circuit_breaker.clone()));
        let manager = ReliabilityManager::new(
            Arc::clone(&limiter),
            retry,
            circuits,
            Arc::clone(&zones),
            config.queue.clone(),
        );

        if let Some(interval) = config.health_check_interval {
            if tokio::runtime::Handle::try_current().is_ok() {
                zones.start_health_task(interval);
            } else {
                debug!("no runtime at construction; zone health task not started");
            }
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                username: config.credentials.username.clone(),
                transport,
                limiter,
                zones,
                manager,
            }),
        })
    }

    /// Resolve the zone owning the configured account via discovery and
    /// register it. Failure is non-fatal; configured zones keep working.
    pub async fn detect_zone(&self) -> Option<ZoneConfig> {
        let detected = self.inner.zones.detect_zone(&self.inner.username).await?;
        self.add_zone(detected.clone());
        Some(detected)
    }

    /// Register a zone at runtime.
    pub fn add_zone(&self, zone: ZoneConfig) {
        self.inner.limiter.register_zone(&zone.zone_id);
        self.inner.zones.add_zone(zone);
    }

    /// Remove a zone; returns whether it existed.
    pub fn remove_zone(&self, zone_id: &str) -> bool {
        self.inner.limiter.remove_zone(zone_id);
        self.inner.zones.remove_zone(zone_id)
    }

    /// All registered zones.
    pub fn zones(&self) -> Vec<ZoneConfig> {
        self.inner.zones.all_zones()
    }

    /// Handle for operations against one entity collection, e.g.
    /// `client.entity("Tickets")`.
    pub fn entity(&self, name: &str) -> EntityHandle {
        EntityHandle {
            endpoint: format!("/{}", name.trim_matches('/')),
            options: RequestOptions::default(),
            client: self.clone(),
        }
    }

    /// Queue an arbitrary request through the reliability layer.
    ///
    /// `endpoint` is the circuit-breaker key root (normally the entity
    /// root, e.g. `/Tickets`); the full path lives on `request`.
    pub async fn send(
        &self,
        endpoint: &str,
        request: ApiRequest,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let method = request.method.to_string();
        let operation = self.operation(request);
        self.inner
            .manager
            .queue_request(endpoint, &method, None, operation, options)
            .await
    }

    fn operation(&self, request: ApiRequest) -> RequestFn {
        let transport = Arc::clone(&self.inner.transport);
        Arc::new(move |base: Url| {
            let transport = Arc::clone(&transport);
            let request = request.clone();
            async move { transport.send(&base, &request).await }.boxed()
        })
    }

    /// Register a pre-request hook, run in order before every attempt.
    pub fn add_request_hook(
        &self,
        hook: impl Fn(&mut ApiRequest) -> Result<()> + Send + Sync + 'static,
    ) {
        self.inner.transport.add_request_hook(hook);
    }

    /// Register a post-response hook, run in order after every attempt.
    pub fn add_response_hook(
        &self,
        hook: impl Fn(&ApiResponse) -> Result<()> + Send + Sync + 'static,
    ) {
        self.inner.transport.add_response_hook(hook);
    }

    /// Aggregate health snapshot.
    pub fn system_health(&self) -> SystemHealth {
        self.inner.manager.system_health()
    }

    /// Cumulative request counters.
    pub fn reliability_metrics(&self) -> ReliabilityMetrics {
        self.inner.manager.metrics()
    }

    /// Per-zone statistics.
    pub fn zone_statistics(&self) -> Vec<ZoneStatistics> {
        self.inner.zones.zone_statistics()
    }

    /// Rate-limit counters.
    pub fn rate_limit_metrics(&self) -> RateLimitMetrics {
        self.inner.manager.rate_limit_metrics()
    }

    /// Retry counters.
    pub fn retry_metrics(&self) -> RetryMetrics {
        self.inner.manager.retry_metrics()
    }

    /// Queue activity snapshot.
    pub fn queue_statistics(&self) -> QueueStatistics {
        self.inner.manager.queue_statistics()
    }

    /// Run one health-check pass over every zone now.
    pub async fn force_health_check(&self) {
        self.inner.zones.force_health_check().await;
    }

    /// Engage or release degraded mode (load shedding below the
    /// configured priority floor).
    pub fn set_degraded_mode(&self, enabled: bool, reason: Option<&str>) {
        self.inner.manager.set_degraded_mode(enabled, reason);
    }

    /// Reject pending requests; see
    /// [`ReliabilityManager::clear_queue`](crate::reliability::ReliabilityManager::clear_queue).
    pub fn clear_queue(&self, force: bool) -> usize {
        self.inner.manager.clear_queue(force)
    }

    /// Stop background tasks, clear the queue and release per-zone and
    /// per-circuit state. Idempotent; required for clean shutdown and
    /// test isolation.
    pub fn destroy(&self) {
        self.inner.manager.destroy();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("username", &self.inner.username)
            .field("zones", &self.inner.zones.zone_count())
            .finish_non_exhaustive()
    }
}

/// Uniform request contract for one entity collection.
///
/// This is the seam the mechanically generated per-entity layer calls
/// into: every operation builds an HTTP request and queues it through
/// the reliability manager.
#[derive(Debug, Clone)]
pub struct EntityHandle {
    endpoint: String,
    options: RequestOptions,
    client: Client,
}

impl EntityHandle {
    /// Override the request options (priority, timeout, retryability,
    /// metadata) used by this handle.
    #[must_use]
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// The endpoint root, e.g. `/Tickets`.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn dispatch(&self, request: ApiRequest) -> Result<ApiResponse> {
        let method = request.method.to_string();
        let operation = self.client.operation(request);
        self.client
            .inner
            .manager
            .queue_request(&self.endpoint, &method, None, operation, self.options.clone())
            .await
    }

    /// Fetch one item by id.
    pub async fn get<T: DeserializeOwned>(&self, id: i64) -> Result<ItemResponse<T>> {
        self.dispatch(ApiRequest::get(format!("{}/{id}", self.endpoint)))
            .await?
            .json()
    }

    /// Run a query: POST `{entity}/query` with filter/sort/paging body.
    pub async fn query<T: DeserializeOwned>(&self, query: &Query) -> Result<ItemsResponse<T>> {
        let body = query.to_body()?;
        self.dispatch(ApiRequest::post(format!("{}/query", self.endpoint), body))
            .await?
            .json()
    }

    /// Count matching items: POST `{entity}/query/count`.
    pub async fn count(&self, query: &Query) -> Result<i64> {
        let body = query.to_body()?;
        let response = self
            .dispatch(ApiRequest::post(
                format!("{}/query/count", self.endpoint),
                body,
            ))
            .await?;
        Ok(response.json::<QueryCountResponse>()?.query_count)
    }

    /// Create an item.
    pub async fn create<B: Serialize>(&self, body: &B) -> Result<SaveResponse> {
        let body = to_value(body)?;
        self.dispatch(ApiRequest::post(self.endpoint.clone(), body))
            .await?
            .json()
    }

    /// Replace an item.
    pub async fn update<B: Serialize>(&self, id: i64, body: &B) -> Result<SaveResponse> {
        let body = to_value(body)?;
        self.dispatch(ApiRequest::put(format!("{}/{id}", self.endpoint), body))
            .await?
            .json()
    }

    /// Partially update an item.
    pub async fn patch<B: Serialize>(&self, id: i64, body: &B) -> Result<SaveResponse> {
        let body = to_value(body)?;
        self.dispatch(ApiRequest::patch(format!("{}/{id}", self.endpoint), body))
            .await?
            .json()
    }

    /// Delete an item.
    pub async fn delete(&self, id: i64) -> Result<()> {
        self.dispatch(ApiRequest::delete(format!("{}/{id}", self.endpoint)))
            .await?;
        Ok(())
    }

    /// Queue a raw request under this entity's circuit key with this
    /// handle's options.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.dispatch(request).await
    }
}

fn to_value<B: Serialize>(body: &B) -> Result<Value> {
    serde_json::to_value(body)
        .map_err(|e| meridian_error::ApiError::unknown(format!("failed to encode request body: {e}")))
}
