//! Integration tests for the health endpoint, the admin backend API and
//! operator overrides, the decision log, health probing and graceful
//! shutdown.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use common::{backend_list, policy, spawn_backend, start_router, RouterOptions};
use inference_router::health::HealthResponse;
use inference_router::routing::backend_client::{BackendTransport, HyperTransport};
use inference_router::routing::health_monitor::HealthState;
use inference_router::server;

#[tokio::test]
async fn health_endpoint_reports_router_state() {
    let b1 = spawn_backend(200, "{}").await;
    let router = start_router(RouterOptions {
        backends: backend_list(&[("b1", &b1)]),
        policies: vec![
            policy("acme", "m", 1, &[("b1", 1)]),
            policy("*", "m", 1, &[("b1", 1)]),
        ],
        ..RouterOptions::default()
    })
    .await;

    assert_eq!(router.dispatch("acme", "m").await.status(), 200);
    assert_eq!(router.dispatch("acme", "missing").await.status(), 404);

    let resp = reqwest::get(router.url("/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let health: HealthResponse = resp.json().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    assert_eq!(health.policies.count, 2);
    assert_eq!(health.policies.origin.as_deref(), Some("store"));
    assert_eq!(health.policies.store.as_deref(), Some("memory"));
    assert_eq!(health.backends.total, 1);
    assert_eq!(health.backends.healthy, 1);
    assert_eq!(health.usage.pending_records, 2);
    assert_eq!(health.usage.publisher, "log");
    assert_eq!(health.stats.requests_dispatched, 1);
    assert_eq!(health.stats.requests_rejected, 1);
    assert_eq!(health.stats.requests_failed, 0);
}

#[tokio::test]
async fn register_backend_then_update_it() {
    let router = start_router(RouterOptions {
        policies: vec![policy("acme", "m", 1, &[("gpu-a", 1)])],
        ..RouterOptions::default()
    })
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .put(router.url("/admin/backends/gpu-a"))
        .json(&json!({"uri": "http://10.0.0.5:9000/v1/infer", "timeout_ms": 1500}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["timeout_ms"], 1500);

    let resp = client
        .put(router.url("/admin/backends/gpu-a"))
        .json(&json!({"uri": "http://10.0.0.6:9000/v1/infer"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        router.state.registry.get("gpu-a").unwrap().uri.as_str(),
        "http://10.0.0.6:9000/v1/infer"
    );

    let resp = client
        .put(router.url("/admin/backends/gpu-b"))
        .json(&json!({"uri": "not a uri"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_BACKEND");

    let listed: Value = reqwest::get(router.url("/admin/backends"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let backends = listed["backends"].as_array().unwrap();
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0]["backend_id"], "gpu-a");
    assert_eq!(backends[0]["registered"], true);
    assert_eq!(backends[0]["state"], "healthy");
}

#[tokio::test]
async fn operator_degrade_holds_until_marked_healthy() {
    let b1 = spawn_backend(200, "{}").await;
    let b2 = spawn_backend(200, "{}").await;
    let router = start_router(RouterOptions {
        backends: backend_list(&[("b1", &b1), ("b2", &b2)]),
        policies: vec![policy("acme", "m", 1, &[("b1", 1000), ("b2", 1)])],
        ..RouterOptions::default()
    })
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .post(router.url("/admin/backends/b1/degrade"))
        .json(&json!({"reason": "driver upgrade"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let view: Value = resp.json().await.unwrap();
    assert_eq!(view["backend_id"], "b1");
    assert_eq!(view["routable"], false);
    assert_eq!(view["hold"]["reason"], "driver upgrade");

    // A passing health check does not lift the hold.
    let transport: Arc<dyn BackendTransport> =
        Arc::new(HyperTransport::new(server::build_http_client()));
    router
        .state
        .health
        .probe_all(&router.state.registry, &transport, Duration::from_secs(1))
        .await;
    for _ in 0..5 {
        assert_eq!(router.dispatch("acme", "m").await.headers()["x-backend-id"], "b2");
    }
    assert_eq!(b1.hits(), 0);

    let health: Value = reqwest::get(router.url("/admin/backends/b1/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["routable"], false);
    assert_eq!(health["state"], "healthy");

    let resp = client
        .post(router.url("/admin/backends/b1/healthy"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let view: Value = resp.json().await.unwrap();
    assert_eq!(view["routable"], true);
    assert!(view.get("hold").is_none());
    assert_eq!(router.dispatch("acme", "m").await.headers()["x-backend-id"], "b1");

    // Empty body is accepted; unknown ids and bad JSON are not.
    let resp = client
        .post(router.url("/admin/backends/b2/degrade"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .post(router.url("/admin/backends/nope/degrade"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "BACKEND_NOT_FOUND");
    let resp = client
        .post(router.url("/admin/backends/b2/degrade"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let resp = reqwest::get(router.url("/admin/backends/nope/health")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn decisions_endpoint_lists_recent_dispatches() {
    let b1 = spawn_backend(200, "{}").await;
    let router = start_router(RouterOptions {
        backends: backend_list(&[("b1", &b1)]),
        policies: vec![policy("acme", "m", 1, &[("b1", 1)])],
        ..RouterOptions::default()
    })
    .await;

    assert_eq!(router.dispatch("acme", "m").await.status(), 200);
    assert_eq!(router.dispatch("acme", "missing").await.status(), 404);
    assert_eq!(router.dispatch("acme", "m").await.status(), 200);

    let all: Value = reqwest::get(router.url("/admin/decisions"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let decisions = all["decisions"].as_array().unwrap();
    assert_eq!(decisions.len(), 3);
    assert_eq!(decisions[0]["backend_id"], "b1");
    assert_eq!(decisions[0]["outcome"], "success");
    assert_eq!(decisions[1]["outcome"], "NO_ROUTING_POLICY");
    assert_eq!(decisions[1]["model"], "missing");

    let last: Value = reqwest::get(router.url("/admin/decisions?limit=1"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let decisions = last["decisions"].as_array().unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0]["model"], "m");
    assert_eq!(decisions[0]["attempts"], 1);
}

#[tokio::test]
async fn probes_mark_backends_unhealthy_and_back() {
    let b1 = spawn_backend(200, "{}").await;
    let b2 = spawn_backend(200, "{}").await;
    let router = start_router(RouterOptions {
        backends: backend_list(&[("b1", &b1), ("b2", &b2)]),
        policies: vec![policy("acme", "m", 1, &[("b1", 1), ("b2", 1)])],
        ..RouterOptions::default()
    })
    .await;
    let transport: Arc<dyn BackendTransport> =
        Arc::new(HyperTransport::new(server::build_http_client()));
    let health = &router.state.health;

    b1.healthy.store(false, Ordering::SeqCst);
    for _ in 0..3 {
        health
            .probe_all(&router.state.registry, &transport, Duration::from_secs(1))
            .await;
    }
    assert_eq!(health.state("b1").unwrap().state, HealthState::Unhealthy);
    assert!(health.is_healthy("b2"));

    // Unhealthy backends are skipped while another candidate is healthy.
    for _ in 0..10 {
        assert_eq!(router.dispatch("acme", "m").await.headers()["x-backend-id"], "b2");
    }
    assert_eq!(b1.hits(), 0);

    let report: HealthResponse = reqwest::get(router.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report.backends.unhealthy, 1);

    b1.healthy.store(true, Ordering::SeqCst);
    health
        .probe_all(&router.state.registry, &transport, Duration::from_secs(1))
        .await;
    assert!(health.is_healthy("b1"));
}

#[tokio::test]
async fn graceful_shutdown_stops_accepting() {
    let router = start_router(RouterOptions {
        policies: vec![policy("*", "m", 1, &[("b1", 1)])],
        ..RouterOptions::default()
    })
    .await;
    let url = router.url("/health");
    assert!(reqwest::get(&url).await.is_ok());

    drop(router);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = reqwest::get(&url).await;
    assert!(result.is_err());
}
