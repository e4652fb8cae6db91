//! Configuration data structures for Synapse.
//!
//! These types map directly to the YAML configuration file. They are
//! intentionally serde-friendly and include defaults so that minimal configs
//! remain concise. A parsed [`Config`] is immutable once it has been wrapped
//! into a snapshot; reload produces a fresh value rather than mutating one
//! in place.
use std::{collections::HashMap, time::Duration};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

/// Top-level configuration: server options, log options, the catalog of
/// available plugins and the route table.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Listener and HTTP server options.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub mode: ServerMode,
    /// Read timeout as a humantime string, e.g. "30s".
    pub read_timeout: String,
    /// Write timeout as a humantime string.
    pub write_timeout: String,
    pub max_header_bytes: usize,
    /// How long to wait for in-flight requests on SIGTERM.
    pub graceful_shutdown_timeout: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            mode: ServerMode::Release,
            read_timeout: "30s".to_string(),
            write_timeout: "30s".to_string(),
            max_header_bytes: 1 << 20,
            graceful_shutdown_timeout: "30s".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.read_timeout)
            .wrap_err_with(|| format!("invalid read_timeout '{}'", self.read_timeout))
    }

    pub fn write_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.write_timeout)
            .wrap_err_with(|| format!("invalid write_timeout '{}'", self.write_timeout))
    }

    pub fn graceful_shutdown_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.graceful_shutdown_timeout).wrap_err_with(|| {
            format!(
                "invalid graceful_shutdown_timeout '{}'",
                self.graceful_shutdown_timeout
            )
        })
    }
}

/// Runtime mode. `debug` lowers the default log filter.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    Debug,
    #[default]
    Release,
}

/// Logging options. Rotation fields (`max_size`, `max_age`, `max_backups`,
/// `compress`) are validated and recorded for external log shippers; the
/// gateway itself writes to `output` without rotating.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// "stdout", "stderr" or a file path.
    pub output: String,
    pub max_size: u64,
    pub max_age: u64,
    pub max_backups: u64,
    pub compress: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            output: "stdout".to_string(),
            max_size: 100,
            max_age: 7,
            max_backups: 3,
            compress: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// The catalog of plugins the configuration makes available to routes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PluginsConfig {
    #[serde(default)]
    pub available: Vec<PluginDecl>,
}

/// A single available-plugin declaration. `order` positions the plugin in
/// every chain that references it (smaller runs earlier); `config` is an
/// opaque bag interpreted by the plugin itself.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PluginDecl {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// A declarative route: a match rule, a target and an optional plugin list.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RouteConfig {
    pub name: String,
    #[serde(rename = "match")]
    pub rule: RouteMatch,
    pub target: TargetConfig,
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Canned response, served when the target scheme is `internal://`.
    #[serde(default)]
    pub response: Option<ResponseConfig>,
}

/// How a request is matched to a route. All populated predicates must hold.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RouteMatch {
    #[serde(rename = "type")]
    pub kind: MatchKind,
    pub path: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Prefix,
    Regex,
    Wildcard,
}

/// Upstream target. A URL with the `internal://` scheme short-circuits the
/// proxy and serves the route's canned response instead.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TargetConfig {
    pub url: String,
    /// Upstream call timeout in milliseconds.
    #[serde(default = "default_target_timeout_ms")]
    pub timeout: u64,
    #[serde(default)]
    pub retries: u32,
}

fn default_target_timeout_ms() -> u64 {
    5_000
}

pub const INTERNAL_SCHEME: &str = "internal://";

impl TargetConfig {
    pub fn is_internal(&self) -> bool {
        self.url.starts_with(INTERNAL_SCHEME)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

/// Canned response for internal routes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResponseConfig {
    pub status: u16,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults_parse() {
        let server = ServerConfig::default();
        assert_eq!(server.read_timeout().unwrap(), Duration::from_secs(30));
        assert_eq!(server.write_timeout().unwrap(), Duration::from_secs(30));
        assert_eq!(
            server.graceful_shutdown_timeout().unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn target_internal_scheme() {
        let target = TargetConfig {
            url: "internal://default".to_string(),
            timeout: 1000,
            retries: 0,
        };
        assert!(target.is_internal());

        let target = TargetConfig {
            url: "http://upstream:8080".to_string(),
            timeout: 1000,
            retries: 0,
        };
        assert!(!target.is_internal());
    }

    #[test]
    fn match_kind_deserializes_from_snake_case() {
        let rule: RouteMatch = serde_json::from_value(serde_json::json!({
            "type": "prefix",
            "path": "/api",
            "priority": 90
        }))
        .unwrap();
        assert_eq!(rule.kind, MatchKind::Prefix);
        assert_eq!(rule.priority, 90);
        assert!(rule.host.is_none());
    }
}
