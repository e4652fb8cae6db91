//! Core gateway orchestration service.
//!
//! The `GatewayService` owns the process-wide singletons: the active
//! snapshot pointer, the plugin registry and the plugin result cache. It
//! exposes exactly two mutations — `bootstrap` at startup and `reload` — and
//! both build a complete replacement snapshot off the request path before a
//! single atomic pointer swap. A failed reload leaves the running snapshot
//! untouched.
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    config::{
        models::Config,
        validation::{ConfigValidator, ValidationError},
    },
    core::{
        plugin::PluginError,
        registry::PluginRegistry,
        result_cache::{DEFAULT_TTL, PluginResultCache},
        snapshot::{Snapshot, SnapshotError},
    },
};

/// Capacity of the lifecycle event channel; on overflow the oldest events
/// are dropped, which is acceptable for informational notifications.
const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Informational state changes, published to whoever subscribes.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Reloaded { routes: usize, plugins: usize },
    ReloadFailed { reason: String },
}

pub struct GatewayService {
    snapshot: ArcSwap<Snapshot>,
    registry: PluginRegistry,
    result_cache: Arc<PluginResultCache>,
    events: broadcast::Sender<LifecycleEvent>,
    sweeper: OnceLock<JoinHandle<()>>,
}

impl GatewayService {
    /// Validate the startup configuration and build the first snapshot.
    pub fn bootstrap(config: Config) -> Result<Arc<Self>, GatewayError> {
        ConfigValidator::validate(&config)?;

        let registry = PluginRegistry::new();
        let result_cache = Arc::new(PluginResultCache::new(DEFAULT_TTL));

        let plan = registry.plan(&config.plugins.available)?;
        let snapshot =
            match Snapshot::build(Arc::new(config), &plan.available, result_cache.clone()) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    registry.abort(plan);
                    return Err(e.into());
                }
            };
        registry.commit(plan);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            registry,
            result_cache,
            events,
            sweeper: OnceLock::new(),
        }))
    }

    /// The active snapshot. Callers hold the returned `Arc` for the duration
    /// of one request; a concurrent reload never mutates it under them.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn result_cache(&self) -> Arc<PluginResultCache> {
        self.result_cache.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Apply a new configuration atomically.
    ///
    /// The new snapshot and plugin generation are fully built and validated
    /// first; only then is the pointer swapped. Plugin instances whose
    /// declaration is byte-identical are carried over (so limiter buckets,
    /// breaker windows and nonce stores survive); replaced instances are
    /// stopped after the swap. Any failure keeps the previous snapshot in
    /// service.
    pub fn reload(&self, config: Config) -> Result<(), GatewayError> {
        let result = self.try_reload(config);
        if let Err(e) = &result {
            let _ = self.events.send(LifecycleEvent::ReloadFailed {
                reason: e.to_string(),
            });
        }
        result
    }

    fn try_reload(&self, config: Config) -> Result<(), GatewayError> {
        ConfigValidator::validate(&config)?;

        let plan = self.registry.plan(&config.plugins.available)?;
        let plugins = plan.available.len();

        let snapshot =
            match Snapshot::build(Arc::new(config), &plan.available, self.result_cache.clone()) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.registry.abort(plan);
                    return Err(e.into());
                }
            };

        let routes = snapshot.routes.len();
        self.snapshot.store(Arc::new(snapshot));

        for retired in self.registry.commit(plan) {
            tracing::info!(plugin = retired.name(), "stopping replaced plugin instance");
            retired.stop();
        }

        let _ = self
            .events
            .send(LifecycleEvent::Reloaded { routes, plugins });
        tracing::info!(routes, plugins, "configuration reloaded");
        Ok(())
    }

    /// Start the janitor that sweeps expired plugin results on the cache TTL
    /// period. Idempotent.
    pub fn start_result_cache_sweeper(&self) {
        self.sweeper.get_or_init(|| {
            let cache = Arc::downgrade(&self.result_cache);
            spawn_cache_sweeper(cache)
        });
    }

    /// Stop plugins and background tasks. Called once at shutdown.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        if let Some(handle) = self.sweeper.get() {
            handle.abort();
        }
    }
}

fn spawn_cache_sweeper(cache: Weak<PluginResultCache>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = cache
            .upgrade()
            .map(|c| c.ttl())
            .unwrap_or(DEFAULT_TTL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else {
                return;
            };
            cache.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::models::{
        MatchKind, PluginDecl, PluginsConfig, RouteConfig, RouteMatch, TargetConfig,
    };

    fn route(name: &str, path: &str, plugins: Vec<String>) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            rule: RouteMatch {
                kind: MatchKind::Prefix,
                path: path.to_string(),
                priority: 10,
                host: None,
                method: None,
                headers: HashMap::new(),
                query_params: HashMap::new(),
            },
            target: TargetConfig {
                url: "http://upstream:8080".to_string(),
                timeout: 1000,
                retries: 0,
            },
            plugins,
            response: None,
        }
    }

    fn config_with_limiter(burst: i64) -> Config {
        Config {
            plugins: PluginsConfig {
                available: vec![PluginDecl {
                    name: "rate_limit".to_string(),
                    enabled: true,
                    order: 10,
                    config: serde_json::json!({"burst": burst})
                        .as_object()
                        .cloned()
                        .unwrap(),
                }],
            },
            routes: vec![route("api", "/api", vec!["rate_limit".to_string()])],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_config() {
        assert!(GatewayService::bootstrap(Config::default()).is_err());
    }

    #[tokio::test]
    async fn reload_swaps_routes_atomically() {
        let gateway = GatewayService::bootstrap(config_with_limiter(5)).unwrap();
        let before = gateway.snapshot();
        assert_eq!(before.routes[0].rule.path, "/api");

        let mut next = config_with_limiter(5);
        next.routes = vec![route("v2", "/v2", vec![])];
        gateway.reload(next).unwrap();

        let after = gateway.snapshot();
        assert_eq!(after.routes[0].rule.path, "/v2");
        // The old snapshot is still intact for requests that captured it.
        assert_eq!(before.routes[0].rule.path, "/api");
        gateway.shutdown();
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let gateway = GatewayService::bootstrap(config_with_limiter(5)).unwrap();

        let mut broken = config_with_limiter(5);
        broken.routes[0].target.url = String::new();
        assert!(gateway.reload(broken).is_err());

        let snapshot = gateway.snapshot();
        assert_eq!(snapshot.routes[0].rule.path, "/api");
        gateway.shutdown();
    }

    #[tokio::test]
    async fn identical_reload_preserves_plugin_instances() {
        let gateway = GatewayService::bootstrap(config_with_limiter(5)).unwrap();
        let before = gateway.snapshot();
        let plugin_before = before.chain("api").unwrap().plugins()[0].clone();

        gateway.reload(config_with_limiter(5)).unwrap();

        let after = gateway.snapshot();
        let plugin_after = after.chain("api").unwrap().plugins()[0].clone();
        assert!(Arc::ptr_eq(&plugin_before, &plugin_after));
        gateway.shutdown();
    }

    #[tokio::test]
    async fn changed_plugin_config_builds_fresh_instance() {
        let gateway = GatewayService::bootstrap(config_with_limiter(5)).unwrap();
        let plugin_before = gateway.snapshot().chain("api").unwrap().plugins()[0].clone();

        gateway.reload(config_with_limiter(50)).unwrap();

        let plugin_after = gateway.snapshot().chain("api").unwrap().plugins()[0].clone();
        assert!(!Arc::ptr_eq(&plugin_before, &plugin_after));
        gateway.shutdown();
    }

    #[tokio::test]
    async fn reload_emits_lifecycle_events() {
        let gateway = GatewayService::bootstrap(config_with_limiter(5)).unwrap();
        let mut events = gateway.subscribe();

        gateway.reload(config_with_limiter(5)).unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            LifecycleEvent::Reloaded { routes: 1, .. }
        ));

        let mut broken = config_with_limiter(5);
        broken.routes.clear();
        let _ = gateway.reload(broken);
        assert!(matches!(
            events.try_recv().unwrap(),
            LifecycleEvent::ReloadFailed { .. }
        ));
        gateway.shutdown();
    }
}
