//! Per-request orchestration: match, run the chain, then forward or answer
//! internally.
use axum::body::Body;
use http::{Response, StatusCode, header};

use crate::core::{
    context::RequestContext,
    plugin::{PluginOutcome, json_error},
    proxy::ProxyEngine,
    snapshot::{Route, Snapshot},
};

/// Body served for internal routes that declare no response.
const DEFAULT_INTERNAL_BODY: &str = "gateway-go is running";

pub struct Dispatcher {
    proxy: ProxyEngine,
}

impl Dispatcher {
    pub fn new(proxy: ProxyEngine) -> Self {
        Self { proxy }
    }

    /// Handle one request against the given snapshot. Every exit path goes
    /// through `ctx.finalize`, which applies staged response headers and
    /// reports the final status to registered observers.
    pub async fn dispatch(
        &self,
        snapshot: &Snapshot,
        ctx: &mut RequestContext,
        body: Body,
    ) -> Response<Body> {
        let Some(route) = snapshot.index().find(ctx) else {
            tracing::debug!(path = %ctx.path, "no matching route");
            return ctx.finalize(json_error(StatusCode::NOT_FOUND, "no matching route"));
        };

        tracing::debug!(route = %route.name, path = %ctx.path, "route matched");
        ctx.target = Some(route.target.url.clone());

        if let Some(chain) = snapshot.chain(&route.name) {
            match chain.execute(ctx).await {
                Ok(PluginOutcome::Continue) => {}
                Ok(PluginOutcome::ShortCircuit(response)) => return ctx.finalize(response),
                Err(e) => {
                    tracing::error!(route = %route.name, error = %e, "plugin chain failed");
                    return ctx.finalize(json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &e.to_string(),
                    ));
                }
            }
        }

        if route.is_internal() {
            return ctx.finalize(internal_response(&route));
        }

        match self.proxy.forward(&route, ctx, body).await {
            Ok(response) => ctx.finalize(response),
            Err(e) => {
                tracing::warn!(route = %route.name, error = %e, "upstream unavailable");
                ctx.finalize(json_error(
                    StatusCode::BAD_GATEWAY,
                    &format!("proxy request failed: {e}"),
                ))
            }
        }
    }
}

fn internal_response(route: &Route) -> Response<Body> {
    let (status, content, content_type) = match &route.response {
        Some(response) => (
            StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK),
            response.content.clone(),
            response
                .content_type
                .clone()
                .unwrap_or_else(|| "text/plain".to_string()),
        ),
        None => (
            StatusCode::OK,
            DEFAULT_INTERNAL_BODY.to_string(),
            "text/plain".to_string(),
        ),
    };

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(content))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
