//! The plugin chain: an ordered composition of plugin instances bound to one
//! route, with result memoization.
use std::sync::Arc;

use crate::core::{
    context::RequestContext,
    plugin::{Plugin, PluginError, PluginOutcome},
    result_cache::PluginResultCache,
};

/// Prefix under which plugins publish cacheable context keys.
pub const RESULT_KEY_PREFIX: &str = "plugin_result_";

/// Ordered plugin composition for a single route. Cheap to clone the Arcs
/// when a snapshot is built; execution happens on the request task.
pub struct Chain {
    plugins: Vec<Arc<dyn Plugin>>,
    cache: Arc<PluginResultCache>,
}

impl Chain {
    /// Build a chain from plugin instances in route-declaration order.
    /// Plugins are sorted by ascending `order`; the sort is stable, so ties
    /// keep the declaration order of the route's plugin list.
    pub fn new(mut plugins: Vec<Arc<dyn Plugin>>, cache: Arc<PluginResultCache>) -> Self {
        plugins.sort_by_key(|p| p.order());
        Self { plugins, cache }
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Execute all plugins sequentially on the caller's task.
    ///
    /// Before each plugin runs, the memoization cache is consulted under the
    /// plugin's request fingerprint; on an unexpired hit the cached context
    /// keys are restored and the plugin is skipped. After a plugin continues
    /// normally, whatever it published under `plugin_result_<name>` is
    /// captured for subsequent requests.
    pub async fn execute(&self, ctx: &mut RequestContext) -> Result<PluginOutcome, PluginError> {
        for plugin in &self.plugins {
            let fingerprint = PluginResultCache::fingerprint(plugin.name(), ctx);
            if let Some(payload) = self.cache.lookup(&fingerprint) {
                tracing::debug!(plugin = plugin.name(), "plugin result served from cache");
                ctx.restore_values(&payload);
                continue;
            }

            match plugin.execute(ctx).await? {
                PluginOutcome::Continue => {
                    let prefix = format!("{RESULT_KEY_PREFIX}{}", plugin.name());
                    let published = ctx.values_with_prefix(&prefix);
                    if !published.is_empty() {
                        self.cache.store(fingerprint, published);
                    }
                }
                PluginOutcome::ShortCircuit(response) => {
                    tracing::debug!(
                        plugin = plugin.name(),
                        status = response.status().as_u16(),
                        "plugin short-circuited request"
                    );
                    return Ok(PluginOutcome::ShortCircuit(response));
                }
            }
        }

        Ok(PluginOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use http::{Method, StatusCode};

    use super::*;
    use crate::core::{context::test_support::context, plugin::json_error};

    struct Recorder {
        name: String,
        order: i32,
        calls: AtomicUsize,
        publish: bool,
        deny: bool,
    }

    impl Recorder {
        fn new(name: &str, order: i32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                order,
                calls: AtomicUsize::new(0),
                publish: false,
                deny: false,
            })
        }

        fn publishing(name: &str, order: i32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                order,
                calls: AtomicUsize::new(0),
                publish: true,
                deny: false,
            })
        }

        fn denying(name: &str, order: i32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                order,
                calls: AtomicUsize::new(0),
                publish: false,
                deny: true,
            })
        }
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        async fn execute(
            &self,
            ctx: &mut RequestContext,
        ) -> Result<PluginOutcome, PluginError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.set_value(format!("seen_{}", self.name), call.to_string());
            if self.deny {
                return Ok(PluginOutcome::ShortCircuit(json_error(
                    StatusCode::FORBIDDEN,
                    "denied",
                )));
            }
            if self.publish {
                ctx.set_value(
                    format!("{RESULT_KEY_PREFIX}{}", self.name),
                    "ok".to_string(),
                );
            }
            Ok(PluginOutcome::Continue)
        }
    }

    fn cache() -> Arc<PluginResultCache> {
        Arc::new(PluginResultCache::new(Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn runs_plugins_in_ascending_order() {
        let first = Recorder::new("first", 5);
        let second = Recorder::new("second", 10);
        // Declared out of order on purpose.
        let chain = Chain::new(
            vec![second.clone() as Arc<dyn Plugin>, first.clone()],
            cache(),
        );
        assert_eq!(chain.plugins()[0].name(), "first");

        let mut ctx = context(Method::GET, "/", "", "example.com");
        let outcome = chain.execute(&mut ctx).await.unwrap();
        assert!(matches!(outcome, PluginOutcome::Continue));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_circuit_stops_downstream_plugins() {
        let deny = Recorder::denying("deny", 1);
        let after = Recorder::new("after", 2);
        let chain = Chain::new(
            vec![deny.clone() as Arc<dyn Plugin>, after.clone()],
            cache(),
        );

        let mut ctx = context(Method::GET, "/", "", "example.com");
        let outcome = chain.execute(&mut ctx).await.unwrap();
        match outcome {
            PluginOutcome::ShortCircuit(response) => {
                assert_eq!(response.status(), StatusCode::FORBIDDEN)
            }
            PluginOutcome::Continue => panic!("expected short-circuit"),
        }
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cached_result_skips_second_execution() {
        let publisher = Recorder::publishing("auth_probe", 1);
        let chain = Chain::new(vec![publisher.clone() as Arc<dyn Plugin>], cache());

        let mut ctx = context(Method::GET, "/api", "", "example.com");
        chain.execute(&mut ctx).await.unwrap();
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);

        // Identical request fingerprint: the plugin is skipped but its
        // published keys reappear on the fresh context.
        let mut ctx = context(Method::GET, "/api", "", "example.com");
        chain.execute(&mut ctx).await.unwrap();
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.value("plugin_result_auth_probe"), Some("ok"));
    }

    #[tokio::test]
    async fn non_publishing_plugin_runs_every_time() {
        let silent = Recorder::new("silent", 1);
        let chain = Chain::new(vec![silent.clone() as Arc<dyn Plugin>], cache());

        for _ in 0..3 {
            let mut ctx = context(Method::GET, "/api", "", "example.com");
            chain.execute(&mut ctx).await.unwrap();
        }
        assert_eq!(silent.calls.load(Ordering::SeqCst), 3);
    }
}
