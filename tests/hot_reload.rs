// Atomic configuration reload: snapshot swapping, in-flight isolation and
// plugin state continuity.
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use http::{Request, Response, StatusCode};
use synapse::{
    config::models::Config,
    core::{Dispatcher, GatewayService, context::RequestContext, proxy::ProxyEngine},
    ports::http_client::{HttpClient, HttpClientResult},
};

struct OkUpstream;

#[async_trait]
impl HttpClient for OkUpstream {
    async fn send_request(&self, _req: Request<Body>) -> HttpClientResult<Response<Body>> {
        Ok(Response::new(Body::from("upstream")))
    }
}

fn config_from_json(json: &str) -> Config {
    serde_json::from_str(json).expect("invalid test config")
}

fn config_a() -> Config {
    config_from_json(
        r#"{
            "plugins": {"available": [{
                "name": "rate_limit",
                "enabled": true,
                "order": 10,
                "config": {"requests_per_second": 0.0, "burst": 2, "ip_based": false}
            }]},
            "routes": [{
                "name": "api",
                "match": {"type": "prefix", "path": "/api", "priority": 90},
                "target": {"url": "http://u:80"},
                "plugins": ["rate_limit"]
            }]
        }"#,
    )
}

fn config_b() -> Config {
    config_from_json(
        r#"{
            "plugins": {"available": [{
                "name": "rate_limit",
                "enabled": true,
                "order": 10,
                "config": {"requests_per_second": 0.0, "burst": 2, "ip_based": false}
            }]},
            "routes": [{
                "name": "v2",
                "match": {"type": "prefix", "path": "/v2", "priority": 90},
                "target": {"url": "http://u:80"},
                "plugins": ["rate_limit"]
            }]
        }"#,
    )
}

fn ctx_for(path: &str) -> RequestContext {
    let (parts, ()) = Request::builder()
        .uri(format!("http://gw.local{path}"))
        .header(http::header::HOST, "gw.local")
        .body(())
        .unwrap()
        .into_parts();
    RequestContext::from_parts(&parts, Some("198.51.100.7".parse().unwrap()), "test".into())
}

#[tokio::test]
async fn requests_after_swap_see_only_the_new_route_table() {
    let gateway = GatewayService::bootstrap(config_a()).unwrap();
    let dispatcher = Dispatcher::new(ProxyEngine::new(Arc::new(OkUpstream)));

    // An in-flight request captures the old snapshot before the reload.
    let inflight_snapshot = gateway.snapshot();

    gateway.reload(config_b()).unwrap();

    // The in-flight request completes against route A.
    let mut ctx = ctx_for("/api/x");
    let response = dispatcher
        .dispatch(&inflight_snapshot, &mut ctx, Body::empty())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // New requests observe exclusively the new snapshot: /api is gone,
    // /v2 is routed.
    let current = gateway.snapshot();
    let mut ctx = ctx_for("/api/x");
    let response = dispatcher.dispatch(&current, &mut ctx, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let mut ctx = ctx_for("/v2/x");
    let response = dispatcher.dispatch(&current, &mut ctx, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);

    gateway.shutdown();
}

#[tokio::test]
async fn limiter_state_survives_reload_with_unchanged_config() {
    let gateway = GatewayService::bootstrap(config_a()).unwrap();
    let dispatcher = Dispatcher::new(ProxyEngine::new(Arc::new(OkUpstream)));

    // Burn the whole burst (rate 0, burst 2) before the reload.
    for _ in 0..2 {
        let mut ctx = ctx_for("/api/x");
        let snapshot = gateway.snapshot();
        let response = dispatcher.dispatch(&snapshot, &mut ctx, Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    gateway.reload(config_a()).unwrap();

    // Same instance, same exhausted bucket: still limited after the swap.
    let mut ctx = ctx_for("/api/x");
    let snapshot = gateway.snapshot();
    let response = dispatcher.dispatch(&snapshot, &mut ctx, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    gateway.shutdown();
}

#[tokio::test]
async fn changed_plugin_config_resets_plugin_state() {
    let gateway = GatewayService::bootstrap(config_a()).unwrap();
    let dispatcher = Dispatcher::new(ProxyEngine::new(Arc::new(OkUpstream)));

    for _ in 0..2 {
        let mut ctx = ctx_for("/api/x");
        let snapshot = gateway.snapshot();
        dispatcher.dispatch(&snapshot, &mut ctx, Body::empty()).await;
    }

    // Bump the burst: a fresh instance replaces the exhausted one.
    let mut changed = config_a();
    changed.plugins.available[0].config = serde_json::json!({
        "requests_per_second": 0.0,
        "burst": 3,
        "ip_based": false
    })
    .as_object()
    .cloned()
    .unwrap();
    gateway.reload(changed).unwrap();

    let mut ctx = ctx_for("/api/x");
    let snapshot = gateway.snapshot();
    let response = dispatcher.dispatch(&snapshot, &mut ctx, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);

    gateway.shutdown();
}

#[tokio::test]
async fn reloading_identical_config_twice_is_a_noop_for_instances() {
    let gateway = GatewayService::bootstrap(config_a()).unwrap();

    let first = gateway.snapshot().chain("api").unwrap().plugins()[0].clone();
    gateway.reload(config_a()).unwrap();
    gateway.reload(config_a()).unwrap();
    let last = gateway.snapshot().chain("api").unwrap().plugins()[0].clone();

    assert!(Arc::ptr_eq(&first, &last));
    gateway.shutdown();
}

#[tokio::test]
async fn rejected_reload_leaves_gateway_serving_old_routes() {
    let gateway = GatewayService::bootstrap(config_a()).unwrap();
    let dispatcher = Dispatcher::new(ProxyEngine::new(Arc::new(OkUpstream)));

    // Route references a plugin that is not declared: fails closed.
    let broken = config_from_json(
        r#"{
            "routes": [{
                "name": "api",
                "match": {"type": "prefix", "path": "/api", "priority": 90},
                "target": {"url": "http://u:80"},
                "plugins": ["ghost"]
            }]
        }"#,
    );
    assert!(gateway.reload(broken).is_err());

    let mut ctx = ctx_for("/api/x");
    let snapshot = gateway.snapshot();
    let response = dispatcher.dispatch(&snapshot, &mut ctx, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);

    gateway.shutdown();
}
