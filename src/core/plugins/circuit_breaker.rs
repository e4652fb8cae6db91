//! Per-upstream circuit breaking over a sliding failure window.
use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock, RwLock, Weak,
        atomic::{AtomicI32, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::core::{
    context::{RequestContext, ResponseObserver},
    plugin::{Plugin, PluginError, PluginOutcome, json_error},
};

pub const NAME: &str = "circuit_breaker";

const WINDOW_BUCKETS: usize = 10;
const JANITOR_INTERVAL: Duration = Duration::from_secs(300);
const IDLE_EVICTION: Duration = Duration::from_secs(1800);

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Settings {
    /// Failure percentage that opens the breaker.
    failure_threshold: u32,
    /// Seconds in `open` before a half-open probe is allowed.
    recovery_timeout: u64,
    /// Concurrent probe budget while half-open.
    half_open_quota: i32,
    /// Failure percentage the window must drop below to close again.
    success_threshold: u32,
    /// Sliding window span in seconds.
    window_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: 30,
            half_open_quota: 2,
            success_threshold: 3,
            window_size: 10,
        }
    }
}

struct WindowBucket {
    failures: AtomicU32,
    successes: AtomicU32,
    started_nanos: AtomicU64,
}

/// Ring of sub-buckets over a sliding time interval. Counter updates and
/// bucket rotation are atomic; a failed rotation race simply lands the
/// observation in the previous bucket.
pub struct SlidingWindow {
    buckets: Vec<WindowBucket>,
    current: AtomicUsize,
    epoch: Instant,
    span_nanos: u64,
}

impl SlidingWindow {
    fn new(len: usize, span: Duration, epoch: Instant) -> Self {
        let buckets = (0..len)
            .map(|_| WindowBucket {
                failures: AtomicU32::new(0),
                successes: AtomicU32::new(0),
                started_nanos: AtomicU64::new(0),
            })
            .collect();
        Self {
            buckets,
            current: AtomicUsize::new(0),
            epoch,
            span_nanos: span.as_nanos() as u64,
        }
    }

    fn nanos(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    fn bucket_span_nanos(&self) -> u64 {
        self.span_nanos / self.buckets.len() as u64
    }

    fn current_bucket(&self, now: Instant) -> &WindowBucket {
        let now_nanos = self.nanos(now);
        let index = self.current.load(Ordering::Acquire);
        let bucket = &self.buckets[index];

        if now_nanos.saturating_sub(bucket.started_nanos.load(Ordering::Acquire))
            >= self.bucket_span_nanos()
        {
            let next = (index + 1) % self.buckets.len();
            if self
                .current
                .compare_exchange(index, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let fresh = &self.buckets[next];
                fresh.failures.store(0, Ordering::Release);
                fresh.successes.store(0, Ordering::Release);
                fresh.started_nanos.store(now_nanos, Ordering::Release);
                return fresh;
            }
        }

        &self.buckets[self.current.load(Ordering::Acquire)]
    }

    pub fn record_failure(&self, now: Instant) {
        self.current_bucket(now).failures.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_success(&self, now: Instant) {
        self.current_bucket(now)
            .successes
            .fetch_add(1, Ordering::AcqRel);
    }

    /// Failure ratio across buckets still inside the window. Zero requests
    /// reports zero.
    pub fn failure_rate(&self, now: Instant) -> f64 {
        let now_nanos = self.nanos(now);
        let window_start = now_nanos.saturating_sub(self.span_nanos);

        let mut failures: u64 = 0;
        let mut total: u64 = 0;
        for bucket in &self.buckets {
            if bucket.started_nanos.load(Ordering::Acquire) < window_start {
                continue;
            }
            let f = u64::from(bucket.failures.load(Ordering::Acquire));
            let s = u64::from(bucket.successes.load(Ordering::Acquire));
            failures += f;
            total += f + s;
        }

        if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        }
    }

    fn current_bucket_age(&self, now: Instant) -> Duration {
        let index = self.current.load(Ordering::Acquire);
        let started = self.buckets[index].started_nanos.load(Ordering::Acquire);
        Duration::from_nanos(self.nanos(now).saturating_sub(started))
    }
}

/// Breaker state for one upstream key.
pub struct BreakerEntry {
    state: AtomicU8,
    half_open_quota: AtomicI32,
    window: SlidingWindow,
    last_used_nanos: AtomicU64,
    epoch: Instant,
    settings: Settings,
}

impl BreakerEntry {
    fn new(settings: Settings, now: Instant) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            half_open_quota: AtomicI32::new(settings.half_open_quota),
            window: SlidingWindow::new(
                WINDOW_BUCKETS,
                Duration::from_secs(settings.window_size),
                now,
            ),
            last_used_nanos: AtomicU64::new(0),
            epoch: now,
            settings,
        }
    }

    fn touch(&self, now: Instant) {
        let nanos = now.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.last_used_nanos.store(nanos, Ordering::Release);
    }

    fn idle_since(&self, now: Instant) -> Duration {
        let nanos = now.saturating_duration_since(self.epoch).as_nanos() as u64;
        Duration::from_nanos(nanos.saturating_sub(self.last_used_nanos.load(Ordering::Acquire)))
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Whether the request may proceed to the upstream at `now`.
    pub fn admit(&self, now: Instant) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let threshold = f64::from(self.settings.failure_threshold) / 100.0;
                if self.window.failure_rate(now) >= threshold {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    return false;
                }
                true
            }
            STATE_OPEN => {
                let recovery = Duration::from_secs(self.settings.recovery_timeout);
                if self.window.current_bucket_age(now) >= recovery
                    && self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.half_open_quota
                        .store(self.settings.half_open_quota, Ordering::Release);
                    return true;
                }
                false
            }
            _ => self.half_open_quota.fetch_sub(1, Ordering::AcqRel) - 1 >= 0,
        }
    }

    /// Record the observed outcome of an admitted request.
    pub fn record(&self, failure: bool, now: Instant) {
        if failure {
            self.window.record_failure(now);
            return;
        }

        self.window.record_success(now);
        if self.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
            let threshold = f64::from(self.settings.success_threshold) / 100.0;
            if self.window.failure_rate(now) < threshold {
                self.state.store(STATE_CLOSED, Ordering::Release);
            }
        }
    }
}

/// Registered on the request context so the breaker sees the final status
/// after the chain and the proxy complete.
struct BreakerObserver {
    entry: Arc<BreakerEntry>,
}

impl ResponseObserver for BreakerObserver {
    fn observe(&self, status: StatusCode) {
        self.entry
            .record(status.as_u16() >= 500, Instant::now());
    }
}

type EntryMap = RwLock<HashMap<String, Arc<BreakerEntry>>>;

pub struct CircuitBreakerPlugin {
    order: i32,
    settings: Settings,
    entries: Arc<EntryMap>,
    janitor: OnceLock<JoinHandle<()>>,
}

impl CircuitBreakerPlugin {
    pub fn new(
        order: i32,
        config: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, PluginError> {
        let settings: Settings =
            serde_json::from_value(serde_json::Value::Object(config.clone()))
                .map_err(|e| PluginError::config(NAME, e.to_string()))?;
        if settings.window_size == 0 {
            return Err(PluginError::config(NAME, "window_size must be positive"));
        }
        if settings.failure_threshold > 100 || settings.success_threshold > 100 {
            return Err(PluginError::config(
                NAME,
                "thresholds are percentages between 0 and 100",
            ));
        }

        Ok(Self {
            order,
            settings,
            entries: Arc::new(RwLock::new(HashMap::new())),
            janitor: OnceLock::new(),
        })
    }

    fn entry(&self, key: &str, now: Instant) -> Arc<BreakerEntry> {
        {
            let entries = self.entries.read().expect("breaker map lock poisoned");
            if let Some(entry) = entries.get(key) {
                entry.touch(now);
                return entry.clone();
            }
        }

        let mut entries = self.entries.write().expect("breaker map lock poisoned");
        if let Some(entry) = entries.get(key) {
            entry.touch(now);
            return entry.clone();
        }

        let entry = Arc::new(BreakerEntry::new(self.settings.clone(), now));
        entry.touch(now);
        entries.insert(key.to_string(), entry.clone());
        entry
    }
}

fn spawn_janitor(entries: Weak<EntryMap>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(entries) = entries.upgrade() else {
                return;
            };
            let now = Instant::now();
            let mut map = entries.write().expect("breaker map lock poisoned");
            let before = map.len();
            map.retain(|_, entry| entry.idle_since(now) <= IDLE_EVICTION);
            let evicted = before - map.len();
            if evicted > 0 {
                tracing::debug!(evicted, "evicted idle circuit breakers");
            }
        }
    })
}

#[async_trait]
impl Plugin for CircuitBreakerPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn execute(&self, ctx: &mut RequestContext) -> Result<PluginOutcome, PluginError> {
        self.janitor
            .get_or_init(|| spawn_janitor(Arc::downgrade(&self.entries)));

        let key = ctx
            .target
            .clone()
            .unwrap_or_else(|| ctx.path.clone());
        let now = Instant::now();
        let entry = self.entry(&key, now);

        if !entry.admit(now) {
            tracing::debug!(key = %key, "circuit breaker rejected request");
            return Ok(PluginOutcome::ShortCircuit(json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "service temporarily unavailable",
            )));
        }

        ctx.add_observer(Arc::new(BreakerObserver { entry }));
        Ok(PluginOutcome::Continue)
    }

    fn stop(&self) {
        if let Some(handle) = self.janitor.get() {
            handle.abort();
        }
    }
}
