//! Request consistency checking: signature, timestamp freshness and nonce
//! replay protection.
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use http::StatusCode;
use md5::{Digest, Md5};
use scc::HashMap as ConcurrentMap;
use serde::Deserialize;
use sha2::Sha256;

use crate::core::{
    context::RequestContext,
    plugin::{Plugin, PluginError, PluginOutcome, json_error},
};

pub const NAME: &str = "consistency";

const DEFAULT_SIGNATURE_FIELD: &str = "X-Signature";
const DEFAULT_TIMESTAMP_VALIDITY_SECS: i64 = 300;

/// Supported signature algorithms. The original design also listed
/// public-key variants, but with only a public key configured there is no
/// signature to produce locally and nothing sound to verify against, so they
/// are rejected at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    HmacSha256,
    Md5,
}

impl Algorithm {
    fn parse(name: &str) -> Result<Self, PluginError> {
        match name {
            "hmac-sha256" => Ok(Self::HmacSha256),
            "md5" => Ok(Self::Md5),
            other => Err(PluginError::config(
                NAME,
                format!("unsupported algorithm '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Settings {
    enabled: bool,
    algorithm: String,
    secret: String,
    fields: Vec<String>,
    signature_field: String,
    timestamp_validity: i64,
    skip_paths: Vec<String>,
    skip_methods: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: "hmac-sha256".to_string(),
            secret: String::new(),
            fields: vec!["timestamp".to_string(), "nonce".to_string()],
            signature_field: DEFAULT_SIGNATURE_FIELD.to_string(),
            timestamp_validity: DEFAULT_TIMESTAMP_VALIDITY_SECS,
            skip_paths: Vec::new(),
            skip_methods: Vec::new(),
        }
    }
}

/// Constant-time byte comparison; the fold touches every byte regardless of
/// where the first mismatch sits.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn bad_request(message: &str) -> PluginOutcome {
    PluginOutcome::ShortCircuit(json_error(StatusCode::BAD_REQUEST, message))
}

pub struct ConsistencyPlugin {
    order: i32,
    settings: Settings,
    algorithm: Algorithm,
    nonces: ConcurrentMap<String, Instant>,
}

impl ConsistencyPlugin {
    pub fn new(
        order: i32,
        config: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, PluginError> {
        let settings: Settings =
            serde_json::from_value(serde_json::Value::Object(config.clone()))
                .map_err(|e| PluginError::config(NAME, e.to_string()))?;
        let algorithm = Algorithm::parse(&settings.algorithm)?;

        if settings.timestamp_validity <= 0 {
            return Err(PluginError::config(
                NAME,
                "timestamp_validity must be positive",
            ));
        }
        if algorithm == Algorithm::HmacSha256 && settings.secret.is_empty() {
            return Err(PluginError::config(NAME, "hmac-sha256 requires a secret"));
        }

        Ok(Self {
            order,
            settings,
            algorithm,
            nonces: ConcurrentMap::new(),
        })
    }

    fn skipped(&self, ctx: &RequestContext) -> bool {
        self.settings
            .skip_methods
            .iter()
            .any(|m| ctx.method.as_str().eq_ignore_ascii_case(m))
            || self.settings.skip_paths.iter().any(|p| &ctx.path == p)
    }

    fn timestamp_fresh(&self, raw: &str, now_unix: i64) -> Result<(), &'static str> {
        let timestamp: i64 = raw.parse().map_err(|_| "invalid timestamp format")?;
        if (now_unix - timestamp).abs() > self.settings.timestamp_validity {
            return Err("timestamp expired");
        }
        Ok(())
    }

    /// Record `nonce` if unseen; a replay returns false. Expired entries are
    /// swept opportunistically while we hold the map anyway.
    async fn claim_nonce(&self, nonce: &str, now: Instant) -> bool {
        let validity = Duration::from_secs(self.settings.timestamp_validity as u64);
        self.nonces
            .retain_async(|_, seen_at| now.saturating_duration_since(*seen_at) <= validity)
            .await;

        self.nonces
            .insert_async(nonce.to_string(), now)
            .await
            .is_ok()
    }

    fn compute_signature(&self, values: &[&str]) -> String {
        let content = values.join("&");
        match self.algorithm {
            Algorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(self.settings.secret.as_bytes())
                    .expect("hmac accepts any key length");
                mac.update(content.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            Algorithm::Md5 => {
                let mut hasher = Md5::new();
                hasher.update(content.as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    }
}

#[async_trait]
impl Plugin for ConsistencyPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn execute(&self, ctx: &mut RequestContext) -> Result<PluginOutcome, PluginError> {
        if !self.settings.enabled || self.skipped(ctx) {
            return Ok(PluginOutcome::Continue);
        }

        let Some(signature) = ctx.header(&self.settings.signature_field) else {
            return Ok(bad_request("missing signature"));
        };
        let signature = signature.to_string();

        let Some(timestamp) = ctx.header("timestamp") else {
            return Ok(bad_request("missing timestamp"));
        };
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        if let Err(reason) = self.timestamp_fresh(timestamp, now_unix) {
            return Ok(bad_request(reason));
        }

        let Some(nonce) = ctx.header("nonce") else {
            return Ok(bad_request("missing nonce"));
        };
        let nonce = nonce.to_string();
        if !self.claim_nonce(&nonce, Instant::now()).await {
            return Ok(bad_request("nonce already used"));
        }

        let mut values = Vec::with_capacity(self.settings.fields.len());
        for field in &self.settings.fields {
            match ctx.header(field) {
                Some(value) if !value.is_empty() => values.push(value),
                _ => {
                    return Ok(bad_request(&format!("missing required field: {field}")));
                }
            }
        }

        let expected = self.compute_signature(&values);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Ok(bad_request("invalid signature"));
        }

        Ok(PluginOutcome::Continue)
    }
}
