//! Interface authentication against an external validator service.
//!
//! Whitelisted paths pass without a callout. Everything else must present a
//! bearer token, which is checked by `GET http://{host}{auth_api}/{token}`:
//! a trimmed response body of `"false"` authenticates the caller, `"true"`
//! rejects it, and anything else is treated as a validator failure.
use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use http::StatusCode;
use regex::Regex;
use serde::Deserialize;

use crate::core::{
    context::RequestContext,
    plugin::{Plugin, PluginError, PluginOutcome, json_response},
};

pub const NAME: &str = "interface_auth";

pub const RESULT_KEY: &str = "plugin_result_interface_auth";

const CALLOUT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    white_interfaces: Vec<String>,
    consumers: ConsumersConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConsumersConfig {
    host: String,
    auth_api: String,
}

fn denial(status: StatusCode, message: &str) -> PluginOutcome {
    PluginOutcome::ShortCircuit(json_response(
        status,
        serde_json::json!({ "code": status.as_u16(), "message": message }),
    ))
}

pub struct InterfaceAuthPlugin {
    order: i32,
    settings: Settings,
    exact: HashSet<String>,
    patterns: Vec<Regex>,
    client: reqwest::Client,
}

impl InterfaceAuthPlugin {
    pub fn new(
        order: i32,
        config: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, PluginError> {
        let settings: Settings =
            serde_json::from_value(serde_json::Value::Object(config.clone()))
                .map_err(|e| PluginError::config(NAME, e.to_string()))?;

        let mut exact = HashSet::new();
        let mut patterns = Vec::new();
        for entry in &settings.white_interfaces {
            if entry.contains('*') {
                let translated = format!("^{}$", entry.replace('*', ".*"));
                let regex = Regex::new(&translated).map_err(|e| {
                    PluginError::config(NAME, format!("invalid whitelist pattern '{entry}': {e}"))
                })?;
                patterns.push(regex);
            } else {
                exact.insert(entry.clone());
            }
        }

        let client = reqwest::Client::builder()
            .timeout(CALLOUT_TIMEOUT)
            .build()
            .map_err(|e| PluginError::config(NAME, e.to_string()))?;

        Ok(Self {
            order,
            settings,
            exact,
            patterns,
            client,
        })
    }

    fn is_whitelisted(&self, path: &str) -> bool {
        self.exact.contains(path) || self.patterns.iter().any(|regex| regex.is_match(path))
    }

    fn bearer_token<'a>(&self, ctx: &'a RequestContext) -> Option<&'a str> {
        ctx.header("Authorization")?
            .strip_prefix("Bearer ")
            .filter(|token| !token.is_empty())
    }

    fn auth_url(&self, token: &str) -> String {
        format!(
            "http://{}{}/{token}",
            self.settings.consumers.host, self.settings.consumers.auth_api
        )
    }
}

#[async_trait]
impl Plugin for InterfaceAuthPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn execute(&self, ctx: &mut RequestContext) -> Result<PluginOutcome, PluginError> {
        if self.is_whitelisted(&ctx.path) {
            ctx.set_value(RESULT_KEY, "whitelist");
            return Ok(PluginOutcome::Continue);
        }

        let Some(token) = self.bearer_token(ctx) else {
            return Ok(denial(StatusCode::UNAUTHORIZED, "Token missing or invalid"));
        };

        let url = self.auth_url(token);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "auth service call failed");
                return Ok(denial(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Auth service call failed",
                ));
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Ok(denial(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Auth service returned status {status}"),
            ));
        }

        let body = response.text().await.unwrap_or_default();
        match body.trim() {
            "false" => {
                ctx.set_value(RESULT_KEY, "success");
                Ok(PluginOutcome::Continue)
            }
            "true" => Ok(denial(StatusCode::FORBIDDEN, "Forbidden: Access denied")),
            "" => Ok(denial(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Auth service returned an empty body",
            )),
            other => {
                tracing::warn!(body = other, "unexpected auth service response");
                Ok(denial(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Unexpected auth service response",
                ))
            }
        }
    }
}
