//! End-to-end tests of the reliability layer against a mock HTTP server.

use std::time::{Duration, Instant};

use meridian_client::prelude::*;
use meridian_client::{
    ApiRequest, CircuitBreakerConfig, HealthStatus, QueueConfig, RateLimitConfig, ZoneConfig,
};
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn zone_for(server: &MockServer, zone_id: &str, priority: u8, backup: bool) -> ZoneConfig {
    let mut zone = ZoneConfig::new(zone_id, Url::parse(&server.uri()).unwrap())
        .with_priority(priority);
    if backup {
        zone = zone.as_backup();
    }
    zone
}

/// Base config: background health polling off (tests drive everything
/// explicitly), generous rate budget unless a test overrides it.
fn base_config() -> ClientConfig {
    ClientConfig::new(Credentials::new("TEST-CODE", "api-user@example.com", "s3cret"))
        .with_health_check_interval(None)
        .with_rate_limit(RateLimitConfig {
            max_requests: 100,
            window: Duration::from_secs(1),
        })
        .with_retry(
            RetryConfig::default()
                .with_max_attempts(1)
                .with_base_delay(Duration::from_millis(10))
                .with_jitter(false),
        )
}

async fn ok_for_any_get(server: &MockServer) {
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"item": {"id": 1}})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn rate_limit_allows_ceiling_then_delays_the_rest() {
    let server = MockServer::start().await;
    ok_for_any_get(&server).await;

    let window = Duration::from_millis(500);
    let config = base_config()
        .with_zone(zone_for(&server, "zone-a", 10, false))
        .with_rate_limit(RateLimitConfig {
            max_requests: 5,
            window,
        });
    let client = Client::new(config).unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let started = Instant::now();
            let result = client
                .send(
                    "/Tickets",
                    ApiRequest::get(format!("/Tickets/{i}")),
                    RequestOptions::default(),
                )
                .await;
            (result, started.elapsed())
        }));
    }

    let mut immediate = 0;
    let mut delayed = 0;
    for handle in handles {
        let (result, elapsed) = handle.await.unwrap();
        assert!(result.is_ok(), "request failed: {result:?}");
        if elapsed < window / 2 {
            immediate += 1;
        } else {
            delayed += 1;
        }
    }
    assert_eq!(immediate, 5, "exactly the ceiling proceeds immediately");
    assert_eq!(delayed, 5, "the overflow waits for window rollover");

    let metrics = client.rate_limit_metrics();
    assert_eq!(metrics.total_recorded, 10);
    assert!(metrics.total_throttled >= 5);

    client.destroy();
}

#[tokio::test]
async fn circuit_opens_after_consecutive_server_errors_and_fails_fast() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Tickets"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = base_config()
        .with_zone(zone_for(&server, "zone-a", 10, false))
        .with_circuit_breaker(
            CircuitBreakerConfig::default()
                .with_failure_threshold(5)
                .with_cooldown(Duration::from_secs(60)),
        );
    let client = Client::new(config).unwrap();

    for _ in 0..5 {
        let err = client
            .send("/Tickets", ApiRequest::get("/Tickets"), RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ServerError { status: 503 }));
    }

    // The sixth call fails fast: circuit-open classification, no attempt.
    let err = client
        .send("/Tickets", ApiRequest::get("/Tickets"), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::CircuitOpen { .. }), "got {err:?}");

    let hits = server.received_requests().await.unwrap();
    assert_eq!(hits.len(), 5, "the open circuit must block the network attempt");

    let health = client.system_health();
    assert!(
        health.overall >= HealthStatus::Degraded,
        "expected degraded or worse, got {}",
        health.overall
    );
    assert_eq!(health.open_circuits, 1);

    client.destroy();
}

#[tokio::test]
async fn open_circuit_on_primary_fails_over_to_backup() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&primary)
        .await;
    ok_for_any_get(&backup).await;

    let config = base_config()
        .with_zone(zone_for(&primary, "zone-a", 10, false))
        .with_zone(zone_for(&backup, "zone-b", 5, true))
        .with_retry(
            RetryConfig::default()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(5))
                .with_jitter(false),
        )
        .with_circuit_breaker(
            CircuitBreakerConfig::default()
                .with_failure_threshold(2)
                .with_cooldown(Duration::from_secs(60)),
        );
    let client = Client::new(config).unwrap();

    // First request: both attempts fail on A (opening its circuit), then
    // the failover hop lands on B.
    let first = client
        .send("/Tickets", ApiRequest::get("/Tickets/1"), RequestOptions::default())
        .await;
    assert!(first.is_ok(), "failover should succeed: {first:?}");

    // Second request: A's circuit is open, so routing goes to B directly.
    let second = client
        .send("/Tickets", ApiRequest::get("/Tickets/2"), RequestOptions::default())
        .await;
    assert!(second.is_ok());

    assert_eq!(primary.received_requests().await.unwrap().len(), 2);
    assert_eq!(backup.received_requests().await.unwrap().len(), 2);

    client.destroy();
}

#[tokio::test]
async fn queue_dispatches_by_priority_with_fifo_among_equals() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Slow/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({}))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    ok_for_any_get(&server).await;

    let config = base_config()
        .with_zone(zone_for(&server, "zone-a", 10, false))
        .with_queue(QueueConfig::default().with_max_concurrency(1));
    let client = Client::new(config).unwrap();

    // Occupy the single dispatch slot so the next four queue up.
    let blocker = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send(
                    "/Slow",
                    ApiRequest::get("/Slow/1"),
                    RequestOptions::default().with_priority(10),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Enqueued in this order with priorities [3, 7, 3, 9].
    let (a, b, c, d) = tokio::join!(
        client.send(
            "/Tickets",
            ApiRequest::get("/Tickets/a"),
            RequestOptions::default().with_priority(3),
        ),
        client.send(
            "/Tickets",
            ApiRequest::get("/Tickets/b"),
            RequestOptions::default().with_priority(7),
        ),
        client.send(
            "/Tickets",
            ApiRequest::get("/Tickets/c"),
            RequestOptions::default().with_priority(3),
        ),
        client.send(
            "/Tickets",
            ApiRequest::get("/Tickets/d"),
            RequestOptions::default().with_priority(9),
        ),
    );
    for result in [&a, &b, &c, &d] {
        assert!(result.is_ok());
    }
    blocker.await.unwrap().unwrap();

    let order: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert_eq!(
        order,
        vec!["/Slow/1", "/Tickets/d", "/Tickets/b", "/Tickets/a", "/Tickets/c"],
        "dispatch order must be priority-descending, FIFO among equals"
    );

    client.destroy();
}

#[tokio::test]
async fn clear_queue_rejects_everything_pending() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Slow/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({}))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;
    ok_for_any_get(&server).await;

    let config = base_config()
        .with_zone(zone_for(&server, "zone-a", 10, false))
        .with_queue(QueueConfig::default().with_max_concurrency(1));
    let client = Client::new(config).unwrap();

    let blocker = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send("/Slow", ApiRequest::get("/Slow/1"), RequestOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut pending = Vec::new();
    for i in 0..3 {
        let client = client.clone();
        pending.push(tokio::spawn(async move {
            client
                .send(
                    "/Tickets",
                    ApiRequest::get(format!("/Tickets/{i}")),
                    RequestOptions::default(),
                )
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cleared = client.clear_queue(true);
    assert_eq!(cleared, 3);
    assert_eq!(client.queue_statistics().depth, 0);

    for handle in pending {
        let err = handle.await.unwrap().unwrap_err();
        assert!(
            matches!(err.kind(), ErrorKind::QueueOverloaded { .. }),
            "cleared requests must be rejected, got {err:?}"
        );
    }
    // The in-flight request is unaffected.
    assert!(blocker.await.unwrap().is_ok());

    client.destroy();
}

#[tokio::test]
async fn retry_recovers_within_attempt_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Flaky/1"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    ok_for_any_get(&server).await;

    let config = base_config()
        .with_zone(zone_for(&server, "zone-a", 10, false))
        .with_retry(
            RetryConfig::default()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(10))
                .with_jitter(false),
        );
    let client = Client::new(config).unwrap();

    let result = client
        .send("/Flaky", ApiRequest::get("/Flaky/1"), RequestOptions::default())
        .await;
    assert!(result.is_ok(), "third attempt should succeed: {result:?}");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    let retries = client.retry_metrics();
    assert_eq!(retries.total_attempts, 3);
    assert_eq!(retries.retried_requests, 1);
    assert_eq!(retries.exhausted_retries, 0);

    let metrics = client.reliability_metrics();
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.successes, 1);
    assert!((metrics.availability - 100.0).abs() < f64::EPSILON);

    client.destroy();
}

#[tokio::test]
async fn request_timeout_settles_the_caller_early() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Slow/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({}))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;
    ok_for_any_get(&server).await;

    let config = base_config()
        .with_zone(zone_for(&server, "zone-a", 10, false))
        .with_queue(QueueConfig::default().with_max_concurrency(1));
    let client = Client::new(config).unwrap();

    let blocker = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send("/Slow", ApiRequest::get("/Slow/1"), RequestOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let err = client
        .send(
            "/Tickets",
            ApiRequest::get("/Tickets/1"),
            RequestOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err.kind(), ErrorKind::QueueTimeout { .. }), "got {err:?}");
    assert!(
        elapsed < Duration::from_millis(350),
        "caller must settle at its own timeout, not the blocker's pace"
    );

    assert!(blocker.await.unwrap().is_ok());
    client.destroy();
}

#[tokio::test]
async fn degraded_mode_sheds_low_priority_but_keeps_high() {
    let server = MockServer::start().await;
    ok_for_any_get(&server).await;

    let config = base_config().with_zone(zone_for(&server, "zone-a", 10, false));
    let client = Client::new(config).unwrap();

    client.set_degraded_mode(true, Some("upstream maintenance"));

    let err = client
        .send(
            "/Tickets",
            ApiRequest::get("/Tickets/low"),
            RequestOptions::default().with_priority(2),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::QueueOverloaded { .. }));

    let high = client
        .send(
            "/Tickets",
            ApiRequest::get("/Tickets/high"),
            RequestOptions::default().with_priority(8),
        )
        .await;
    assert!(high.is_ok());

    client.set_degraded_mode(false, None);
    let low_again = client
        .send(
            "/Tickets",
            ApiRequest::get("/Tickets/low"),
            RequestOptions::default().with_priority(2),
        )
        .await;
    assert!(low_again.is_ok());

    assert!(client.queue_statistics().total_rejected >= 1);
    assert!(client.system_health().overall == HealthStatus::Healthy);

    client.destroy();
}

#[tokio::test]
async fn auth_failures_surface_once_with_context() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "errors": ["invalid credentials"]
        })))
        .mount(&server)
        .await;

    let config = base_config()
        .with_zone(zone_for(&server, "zone-a", 10, false))
        .with_retry(RetryConfig::default().with_max_attempts(3));
    let client = Client::new(config).unwrap();

    let err = client
        .send("/Tickets", ApiRequest::get("/Tickets/1"), RequestOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::AuthenticationFailed { status: 401 }));
    let context = err.context().expect("classified errors carry context");
    assert_eq!(context.endpoint, "/Tickets");
    assert_eq!(context.method, "GET");
    assert_eq!(context.zone.as_deref(), Some("zone-a"));
    assert!(context.request_id.is_some());

    // Non-retryable: exactly one attempt despite the retry budget.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    client.destroy();
}

#[tokio::test]
async fn credentials_ride_every_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("ApiIntegrationCode", "TEST-CODE"))
        .and(header("UserName", "api-user@example.com"))
        .and(header("Secret", "s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"item": {}})))
        .mount(&server)
        .await;

    let config = base_config().with_zone(zone_for(&server, "zone-a", 10, false));
    let client = Client::new(config).unwrap();

    let result = client
        .send("/Tickets", ApiRequest::get("/Tickets/1"), RequestOptions::default())
        .await;
    assert!(result.is_ok(), "auth headers missing: {result:?}");

    client.destroy();
}

#[tokio::test]
async fn request_hooks_mutate_and_short_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("X-Trace", "hooked"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"item": {}})))
        .mount(&server)
        .await;

    let config = base_config().with_zone(zone_for(&server, "zone-a", 10, false));
    let client = Client::new(config).unwrap();
    client.add_request_hook(|req| {
        req.headers.push(("X-Trace".into(), "hooked".into()));
        Ok(())
    });

    let result = client
        .send("/Tickets", ApiRequest::get("/Tickets/1"), RequestOptions::default())
        .await;
    assert!(result.is_ok(), "hook header missing: {result:?}");

    // A failing pre-hook aborts before the network.
    client.add_request_hook(|_| Err(ApiError::validation_failed(400, "blocked by policy")));
    let err = client
        .send("/Tickets", ApiRequest::get("/Tickets/2"), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ValidationFailed { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    client.destroy();
}

#[tokio::test]
async fn entity_query_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Tickets/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [{ "id": 1, "title": "Printer on fire" }],
            "pageDetails": { "count": 1, "requestCount": 1, "nextPageUrl": null },
        })))
        .mount(&server)
        .await;

    let config = base_config().with_zone(zone_for(&server, "zone-a", 10, false));
    let client = Client::new(config).unwrap();

    let tickets: ItemsResponse<serde_json::Value> = client
        .entity("Tickets")
        .query(&Query::new(Filter::eq("status", 1)).with_page_size(25))
        .await
        .unwrap();
    assert_eq!(tickets.items.len(), 1);
    assert_eq!(tickets.page_details.unwrap().count, 1);

    let sent = &server.received_requests().await.unwrap()[0];
    let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
    assert_eq!(body["filter"][0]["op"], "eq");
    assert_eq!(body["pageSize"], 25);

    client.destroy();
}

#[tokio::test]
async fn zone_detection_registers_the_discovered_zone() {
    let discovery = MockServer::start().await;
    let zone_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("user", "api-user@example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "zoneName": "zone-x",
            "url": zone_server.uri(),
        })))
        .mount(&discovery)
        .await;

    let config = base_config().with_discovery_url(Url::parse(&discovery.uri()).unwrap());
    let client = Client::new(config).unwrap();

    let detected = client.detect_zone().await.expect("detection should succeed");
    assert_eq!(detected.zone_id, "zone-x");
    assert!(client.zones().iter().any(|z| z.zone_id == "zone-x"));

    client.destroy();
}

#[tokio::test]
async fn failed_zone_detection_is_non_fatal() {
    let discovery = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&discovery)
        .await;

    let config = base_config().with_discovery_url(Url::parse(&discovery.uri()).unwrap());
    let client = Client::new(config).unwrap();

    assert!(client.detect_zone().await.is_none());
    assert!(client.zones().is_empty());

    client.destroy();
}

#[tokio::test]
async fn destroy_is_idempotent_and_rejects_new_work() {
    let server = MockServer::start().await;
    ok_for_any_get(&server).await;

    let config = base_config().with_zone(zone_for(&server, "zone-a", 10, false));
    let client = Client::new(config).unwrap();

    let warmup = client
        .send("/Tickets", ApiRequest::get("/Tickets/1"), RequestOptions::default())
        .await;
    assert!(warmup.is_ok());

    client.destroy();
    client.destroy();

    let err = client
        .send("/Tickets", ApiRequest::get("/Tickets/2"), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::QueueOverloaded { .. }));
}
