//! Per-key token-bucket rate limiting.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock, RwLock, Weak},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::core::{
    context::RequestContext,
    plugin::{Plugin, PluginError, PluginOutcome, json_error},
};

pub const NAME: &str = "rate_limit";

const JANITOR_INTERVAL: Duration = Duration::from_secs(300);
const IDLE_EVICTION: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Settings {
    requests_per_second: f64,
    burst: i64,
    /// Key buckets by client IP instead of request path.
    ip_based: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20,
            ip_based: false,
        }
    }
}

/// Token-bucket state for one limiter key. Refill is lazy: tokens accrue on
/// access from the elapsed time since the last refill, clamped at capacity.
pub struct TokenBucket {
    rate: f64,
    capacity: i64,
    tokens: i64,
    last_refill: Instant,
    last_used: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: i64, now: Instant) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: now,
            last_used: now,
        }
    }

    /// Try to take one token at `now`.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let refill = (elapsed.as_secs_f64() * self.rate).floor() as i64;
        if refill > 0 {
            self.tokens = self.capacity.min(self.tokens + refill);
            self.last_refill = now;
        }
        self.last_used = now;

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    fn idle_since(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }
}

type BucketMap = RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>;

pub struct RateLimitPlugin {
    order: i32,
    settings: Settings,
    buckets: Arc<BucketMap>,
    /// Spawned on first use so construction stays runtime-free.
    janitor: OnceLock<JoinHandle<()>>,
}

impl RateLimitPlugin {
    pub fn new(order: i32, config: &serde_json::Map<String, serde_json::Value>) -> Result<Self, PluginError> {
        let settings: Settings =
            serde_json::from_value(serde_json::Value::Object(config.clone()))
                .map_err(|e| PluginError::config(NAME, e.to_string()))?;
        if settings.requests_per_second < 0.0 {
            return Err(PluginError::config(
                NAME,
                "requests_per_second must not be negative",
            ));
        }
        if settings.burst <= 0 {
            return Err(PluginError::config(NAME, "burst must be positive"));
        }

        Ok(Self {
            order,
            settings,
            buckets: Arc::new(RwLock::new(HashMap::new())),
            janitor: OnceLock::new(),
        })
    }

    fn limit_key(&self, ctx: &RequestContext) -> String {
        if self.settings.ip_based {
            if let Some(ip) = ctx.client_ip {
                return ip.to_string();
            }
        }
        ctx.path.clone()
    }

    /// Fetch or lazily create the bucket for `key`, taking the write lock
    /// only on first sight of the key.
    fn bucket(&self, key: &str) -> Arc<Mutex<TokenBucket>> {
        {
            let buckets = self.buckets.read().expect("bucket map lock poisoned");
            if let Some(bucket) = buckets.get(key) {
                return bucket.clone();
            }
        }

        let mut buckets = self.buckets.write().expect("bucket map lock poisoned");
        if let Some(bucket) = buckets.get(key) {
            return bucket.clone();
        }

        let bucket = Arc::new(Mutex::new(TokenBucket::new(
            self.settings.requests_per_second,
            self.settings.burst,
            Instant::now(),
        )));
        buckets.insert(key.to_string(), bucket.clone());
        bucket
    }
}

fn spawn_janitor(buckets: Weak<BucketMap>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(buckets) = buckets.upgrade() else {
                return;
            };
            let now = Instant::now();
            let mut map = buckets.write().expect("bucket map lock poisoned");
            let before = map.len();
            map.retain(|_, bucket| {
                bucket
                    .lock()
                    .map(|b| b.idle_since(now) <= IDLE_EVICTION)
                    .unwrap_or(false)
            });
            let evicted = before - map.len();
            if evicted > 0 {
                tracing::debug!(evicted, "evicted idle rate-limit buckets");
            }
        }
    })
}

#[async_trait]
impl Plugin for RateLimitPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn execute(&self, ctx: &mut RequestContext) -> Result<PluginOutcome, PluginError> {
        self.janitor
            .get_or_init(|| spawn_janitor(Arc::downgrade(&self.buckets)));

        let key = self.limit_key(ctx);
        let bucket = self.bucket(&key);

        let allowed = bucket
            .lock()
            .map(|mut b| b.allow_at(Instant::now()))
            .map_err(|_| PluginError::execution(NAME, "bucket lock poisoned"))?;

        if allowed {
            Ok(PluginOutcome::Continue)
        } else {
            tracing::debug!(key = %key, "rate limit exceeded");
            Ok(PluginOutcome::ShortCircuit(json_error(
                StatusCode::TOO_MANY_REQUESTS,
                "too many requests",
            )))
        }
    }

    fn stop(&self) {
        if let Some(handle) = self.janitor.get() {
            handle.abort();
        }
    }
}
