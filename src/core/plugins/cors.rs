//! Cross-origin resource sharing policy.
//!
//! Preflight requests terminate here; for actual requests the allow/expose
//! headers are staged on the context and applied to whatever response ends
//! the request. Publishes nothing cacheable because the emitted headers vary
//! with the `Origin` header, which is not part of the result fingerprint.
use async_trait::async_trait;
use axum::body::Body;
use http::{HeaderValue, Method, Response, StatusCode, header};
use serde::Deserialize;

use crate::core::{
    context::RequestContext,
    plugin::{Plugin, PluginError, PluginOutcome},
};

pub const NAME: &str = "cors";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Settings {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    exposed_headers: Vec<String>,
    max_age: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .map(String::from)
                .to_vec(),
            allowed_headers: vec!["*".to_string()],
            exposed_headers: vec!["Content-Length".to_string()],
            max_age: "43200".to_string(),
        }
    }
}

pub struct CorsPlugin {
    order: i32,
    settings: Settings,
}

impl CorsPlugin {
    pub fn new(
        order: i32,
        config: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, PluginError> {
        let settings: Settings =
            serde_json::from_value(serde_json::Value::Object(config.clone()))
                .map_err(|e| PluginError::config(NAME, e.to_string()))?;
        Ok(Self { order, settings })
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        if origin.is_empty() || self.settings.allowed_origins.is_empty() {
            return false;
        }
        self.settings
            .allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }

    fn preflight(&self, origin: &str) -> Response<Body> {
        if !self.origin_allowed(origin) {
            return Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(Body::empty())
                .unwrap_or_else(|_| Response::new(Body::empty()));
        }

        let mut builder = Response::builder().status(StatusCode::OK);
        builder = builder
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin)
            .header(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                self.settings.allowed_methods.join(", "),
            )
            .header(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                self.settings.allowed_headers.join(", "),
            )
            .header(header::ACCESS_CONTROL_EXPOSE_HEADERS, self.settings.exposed_headers.join(", "))
            .header(header::ACCESS_CONTROL_MAX_AGE, &self.settings.max_age);

        builder
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

#[async_trait]
impl Plugin for CorsPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn execute(&self, ctx: &mut RequestContext) -> Result<PluginOutcome, PluginError> {
        let origin = ctx.header("Origin").unwrap_or_default().to_string();

        if ctx.method == Method::OPTIONS {
            return Ok(PluginOutcome::ShortCircuit(self.preflight(&origin)));
        }

        if !origin.is_empty() && self.origin_allowed(&origin) {
            if let Ok(value) = HeaderValue::from_str(&origin) {
                ctx.stage_response_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            }
            if let Ok(value) = HeaderValue::from_str(&self.settings.exposed_headers.join(", ")) {
                ctx.stage_response_header(header::ACCESS_CONTROL_EXPOSE_HEADERS, value);
            }
        }

        Ok(PluginOutcome::Continue)
    }
}
