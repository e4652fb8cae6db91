//! The plugin abstraction: a small capability set every policy plugin
//! implements, plus the outcome and error types the chain propagates.
use async_trait::async_trait;
use axum::body::Body;
use http::Response;
use thiserror::Error;

use crate::core::context::RequestContext;

/// What a plugin decided about the current request.
pub enum PluginOutcome {
    /// Keep going: run the next plugin, then the proxy (or internal response).
    Continue,
    /// The plugin produced the final response; nothing downstream runs.
    ShortCircuit(Response<Body>),
}

/// Plugin failures. Construction errors abort a reload; execution errors
/// bubble to the dispatcher, which renders a single 500.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unknown plugin '{0}'")]
    Unknown(String),

    #[error("plugin '{plugin}' config error: {message}")]
    Config { plugin: String, message: String },

    #[error("plugin '{plugin}' failed: {message}")]
    Execution { plugin: String, message: String },
}

impl PluginError {
    pub fn config(plugin: &str, message: impl Into<String>) -> Self {
        Self::Config {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }

    pub fn execution(plugin: &str, message: impl Into<String>) -> Self {
        Self::Execution {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }
}

/// A policy plugin bound into route chains.
///
/// Instances are built by the registry from an available-plugin declaration
/// and shared by every chain that references them within one snapshot
/// generation. Internal state (buckets, breaker windows, nonces) lives inside
/// the instance and survives reload when the declaration's serialized config
/// is unchanged.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Position in the chain; smaller runs earlier.
    fn order(&self) -> i32;

    /// Names of plugins this one expects to run after. Informational.
    fn dependencies(&self) -> &[String] {
        &[]
    }

    async fn execute(&self, ctx: &mut RequestContext) -> Result<PluginOutcome, PluginError>;

    /// Release background resources (janitor tasks). Called when a reload
    /// replaces the instance and at shutdown.
    fn stop(&self) {}
}

/// Standard JSON error body used by plugin denials and dispatcher errors.
pub fn json_response(status: http::StatusCode, body: serde_json::Value) -> Response<Body> {
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

pub fn json_error(status: http::StatusCode, message: &str) -> Response<Body> {
    json_response(status, serde_json::json!({ "error": message }))
}
