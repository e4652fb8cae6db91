//! Reverse-proxy engine: rewrites the matched request and streams it to the
//! route's upstream.
use axum::body::Body;
use http::{HeaderValue, Request, Response, Uri, header};
use thiserror::Error;
use tokio::time::timeout;

use std::sync::Arc;

use crate::{
    core::{
        context::RequestContext,
        snapshot::{Route, strip_prefix},
    },
    ports::http_client::HttpClient,
};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("route '{0}' has no upstream target")]
    NoUpstream(String),

    #[error("failed to build upstream request: {0}")]
    BadRequest(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream timed out after {0} ms")]
    Timeout(u128),
}

/// Methods safe to retry on transport failure. Retries additionally require
/// an empty request body, since a consumed stream cannot be replayed.
fn is_idempotent(method: &http::Method) -> bool {
    matches!(
        *method,
        http::Method::GET
            | http::Method::HEAD
            | http::Method::OPTIONS
            | http::Method::PUT
            | http::Method::DELETE
            | http::Method::TRACE
    )
}

fn has_body(ctx: &RequestContext) -> bool {
    if let Some(length) = ctx.header("content-length") {
        return length.parse::<u64>().map(|n| n > 0).unwrap_or(true);
    }
    ctx.headers.contains_key(header::TRANSFER_ENCODING)
}

pub struct ProxyEngine {
    client: Arc<dyn HttpClient>,
}

impl ProxyEngine {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }

    /// Forward the request to the route's upstream and stream the response
    /// back. Transport failures are retried up to `target.retries` times for
    /// idempotent, bodyless requests; completed upstream responses (any
    /// status) are returned as-is, never retried.
    pub async fn forward(
        &self,
        route: &Route,
        ctx: &RequestContext,
        body: Body,
    ) -> Result<Response<Body>, ProxyError> {
        let upstream = route
            .upstream
            .as_ref()
            .ok_or_else(|| ProxyError::NoUpstream(route.name.clone()))?;

        let authority = match upstream.port() {
            Some(port) => format!("{}:{port}", upstream.host_str().unwrap_or_default()),
            None => upstream.host_str().unwrap_or_default().to_string(),
        };

        let path = strip_prefix(route.rule.kind, &route.rule.path, &ctx.path);
        let path_and_query = if ctx.raw_query.is_empty() {
            path
        } else {
            format!("{path}?{}", ctx.raw_query)
        };
        let uri: Uri = format!("{}://{authority}{path_and_query}", upstream.scheme())
            .parse()
            .map_err(|e: http::uri::InvalidUri| ProxyError::BadRequest(e.to_string()))?;

        let replayable = is_idempotent(&ctx.method) && !has_body(ctx);
        let attempts = if replayable {
            1 + route.target.retries
        } else {
            1
        };

        let mut body_slot = Some(body);
        let mut last_error = ProxyError::Upstream("no attempt was made".to_string());

        for attempt in 0..attempts {
            let request = self
                .build_request(route, ctx, &uri, &authority, body_slot.take().unwrap_or_else(Body::empty))
                .map_err(|e| ProxyError::BadRequest(e.to_string()))?;

            match timeout(route.target.timeout(), self.client.send_request(request)).await {
                Ok(Ok(response)) => {
                    if attempt > 0 {
                        tracing::info!(
                            route = %route.name,
                            attempt = attempt + 1,
                            "upstream call succeeded after retry"
                        );
                    }
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        route = %route.name,
                        attempt = attempt + 1,
                        error = %e,
                        "upstream transport failure"
                    );
                    last_error = ProxyError::Upstream(e.to_string());
                }
                Err(_) => {
                    let elapsed = route.target.timeout().as_millis();
                    tracing::warn!(
                        route = %route.name,
                        attempt = attempt + 1,
                        timeout_ms = elapsed as u64,
                        "upstream call timed out"
                    );
                    last_error = ProxyError::Timeout(elapsed);
                }
            }
        }

        Err(last_error)
    }

    fn build_request(
        &self,
        route: &Route,
        ctx: &RequestContext,
        uri: &Uri,
        authority: &str,
        body: Body,
    ) -> Result<Request<Body>, http::Error> {
        let mut request = Request::builder()
            .method(ctx.method.clone())
            .uri(uri.clone())
            .body(body)?;

        *request.headers_mut() = ctx.headers.clone();

        let headers = request.headers_mut();
        if let Ok(host) = HeaderValue::from_str(authority) {
            headers.insert(header::HOST, host.clone());
            headers.insert("X-Origin-Host", host);
        }
        if let Ok(original) = HeaderValue::from_str(&ctx.host) {
            headers.insert("X-Forwarded-Host", original);
        }

        tracing::debug!(
            route = %route.name,
            upstream = %uri,
            "forwarding request upstream"
        );
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use http::{Method, StatusCode};

    use super::*;
    use crate::{
        config::models::MatchKind,
        core::{context::test_support::context, snapshot::test_support::route_with},
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    /// Scripted upstream: fails `failures` times, then answers 200.
    struct ScriptedClient {
        failures: usize,
        calls: AtomicUsize,
        seen_uris: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
                seen_uris: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_uris.lock().unwrap().push(req.uri().to_string());
            if call < self.failures {
                return Err(HttpClientError::ConnectionError("refused".to_string()));
            }
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Body::empty())
                .unwrap())
        }
    }

    fn route_with_retries(retries: u32) -> Route {
        let mut route = route_with("api", MatchKind::Prefix, "/api", 10);
        {
            let inner = Arc::get_mut(&mut route).unwrap();
            inner.target.retries = retries;
        }
        Arc::try_unwrap(route).unwrap_or_else(|_| unreachable!())
    }

    #[tokio::test]
    async fn forwards_with_rewritten_path_and_headers() {
        let client = ScriptedClient::failing(0);
        let engine = ProxyEngine::new(client.clone());
        let route = route_with_retries(0);

        let ctx = context(Method::GET, "/api/users", "page=2", "gw.example.com");
        let response = engine.forward(&route, &ctx, Body::empty()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Port 80 is the scheme default, so the parsed URL drops it.
        let uris = client.seen_uris.lock().unwrap();
        assert_eq!(uris[0], "http://upstream/users?page=2");
    }

    #[tokio::test]
    async fn transport_failures_are_retried_up_to_cap() {
        let client = ScriptedClient::failing(2);
        let engine = ProxyEngine::new(client.clone());
        let route = route_with_retries(3);

        let ctx = context(Method::GET, "/api/x", "", "gw.example.com");
        let response = engine.forward(&route, &ctx, Body::empty()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_transport_error() {
        let client = ScriptedClient::failing(usize::MAX);
        let engine = ProxyEngine::new(client.clone());
        let route = route_with_retries(3);

        let ctx = context(Method::GET, "/api/x", "", "gw.example.com");
        let error = engine.forward(&route, &ctx, Body::empty()).await.unwrap_err();
        assert!(matches!(error, ProxyError::Upstream(_)));
        // 1 initial attempt + 3 retries.
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_idempotent_methods_are_never_retried() {
        let client = ScriptedClient::failing(usize::MAX);
        let engine = ProxyEngine::new(client.clone());
        let route = route_with_retries(3);

        let ctx = context(Method::POST, "/api/x", "", "gw.example.com");
        let _ = engine.forward(&route, &ctx, Body::empty()).await.unwrap_err();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn requests_with_bodies_are_never_retried() {
        let client = ScriptedClient::failing(usize::MAX);
        let engine = ProxyEngine::new(client.clone());
        let route = route_with_retries(3);

        let mut ctx = context(Method::PUT, "/api/x", "", "gw.example.com");
        ctx.headers.insert("content-length", "12".parse().unwrap());
        let _ = engine
            .forward(&route, &ctx, Body::from("hello world!"))
            .await
            .unwrap_err();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn host_headers_are_rewritten() {
        let client = ScriptedClient::failing(0);

        struct CapturingClient {
            inner: Arc<ScriptedClient>,
            headers: Mutex<Option<http::HeaderMap>>,
        }

        #[async_trait]
        impl HttpClient for CapturingClient {
            async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
                *self.headers.lock().unwrap() = Some(req.headers().clone());
                self.inner.send_request(req).await
            }
        }

        let capturing = Arc::new(CapturingClient {
            inner: client,
            headers: Mutex::new(None),
        });
        let engine = ProxyEngine::new(capturing.clone());
        let route = route_with_retries(0);

        let ctx = context(Method::GET, "/api/x", "", "gw.example.com");
        engine.forward(&route, &ctx, Body::empty()).await.unwrap();

        let headers = capturing.headers.lock().unwrap().clone().unwrap();
        assert_eq!(headers.get(header::HOST).unwrap(), "upstream");
        assert_eq!(headers.get("X-Origin-Host").unwrap(), "upstream");
        assert_eq!(headers.get("X-Forwarded-Host").unwrap(), "gw.example.com");
    }
}
