use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::body::Body;
use http::{Request, Response, StatusCode, header};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    core::{Dispatcher, GatewayService, context::RequestContext},
    tracing_setup,
};

/// Path of the built-in liveness endpoint; it bypasses the route engine.
pub const HEALTH_PATH: &str = "/gatewaygo/health";

/// HTTP entry point: builds the per-request context, answers the built-in
/// endpoints and hands everything else to the dispatcher against the current
/// snapshot.
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
    dispatcher: Dispatcher,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>, dispatcher: Dispatcher) -> Self {
        Self {
            gateway,
            dispatcher,
        }
    }

    pub async fn handle_request(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        if req.uri().path() == HEALTH_PATH {
            return health_response();
        }

        let start_time = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let (parts, body) = req.into_parts();
        let client_ip = client_addr.map(|addr| addr.ip());
        let mut ctx = RequestContext::from_parts(&parts, client_ip, request_id.clone());

        let user_agent = ctx.header(header::USER_AGENT.as_str()).map(String::from);
        let span = tracing_setup::create_request_span(
            ctx.method.as_str(),
            &ctx.path,
            &request_id,
            client_ip.map(|ip| ip.to_string()).as_deref(),
            user_agent.as_deref(),
        );

        // One atomic snapshot read per request; a concurrent reload does not
        // affect us once we hold the Arc.
        let snapshot = self.gateway.snapshot();

        let response = async { self.dispatcher.dispatch(&snapshot, &mut ctx, body).await }
            .instrument(span.clone())
            .await;

        let duration = start_time.elapsed();
        span.record("http.status_code", response.status().as_u16());
        span.record("duration_ms", duration.as_millis() as u64);
        tracing::info!(
            parent: &span,
            status = response.status().as_u16(),
            duration_ms = duration.as_millis() as u64,
            "request completed"
        );

        response
    }
}

fn health_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"status":"ok"}"#))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use http_body_util::BodyExt;

    use super::*;
    use crate::{
        config::models::{
            Config, MatchKind, PluginsConfig, ResponseConfig, RouteConfig, RouteMatch,
            TargetConfig,
        },
        core::proxy::ProxyEngine,
        ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    };

    struct UnreachableClient;

    #[async_trait]
    impl HttpClient for UnreachableClient {
        async fn send_request(
            &self,
            _req: Request<Body>,
        ) -> HttpClientResult<Response<Body>> {
            Err(HttpClientError::ConnectionError("refused".to_string()))
        }
    }

    fn handler() -> HttpHandler {
        let config = Config {
            plugins: PluginsConfig::default(),
            routes: vec![RouteConfig {
                name: "health".to_string(),
                rule: RouteMatch {
                    kind: MatchKind::Exact,
                    path: "/health".to_string(),
                    priority: 100,
                    host: None,
                    method: None,
                    headers: HashMap::new(),
                    query_params: HashMap::new(),
                },
                target: TargetConfig {
                    url: "internal://default".to_string(),
                    timeout: 1000,
                    retries: 0,
                },
                plugins: Vec::new(),
                response: Some(ResponseConfig {
                    status: 200,
                    content: "ok".to_string(),
                    content_type: Some("text/plain".to_string()),
                }),
            }],
            ..Config::default()
        };

        let gateway = GatewayService::bootstrap(config).unwrap();
        let dispatcher = Dispatcher::new(ProxyEngine::new(Arc::new(UnreachableClient)));
        HttpHandler::new(gateway, dispatcher)
    }

    #[tokio::test]
    async fn builtin_health_endpoint_bypasses_routing() {
        let handler = handler();
        let request = Request::builder()
            .uri(format!("http://gw{HEALTH_PATH}"))
            .body(Body::empty())
            .unwrap();

        let response = handler.handle_request(request, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn routed_request_reaches_dispatcher() {
        let handler = handler();
        let request = Request::builder()
            .uri("http://gw/health")
            .header(header::HOST, "gw")
            .body(Body::empty())
            .unwrap();

        let response = handler.handle_request(request, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn unmatched_request_is_404() {
        let handler = handler();
        let request = Request::builder()
            .uri("http://gw/missing")
            .header(header::HOST, "gw")
            .body(Body::empty())
            .unwrap();

        let response = handler.handle_request(request, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
