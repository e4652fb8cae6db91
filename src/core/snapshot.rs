//! Immutable configuration snapshots.
//!
//! A snapshot bundles everything request handling needs: the validated
//! config, the route list with pre-parsed targets, the per-route plugin
//! chains and the route index. The active snapshot sits behind an
//! `ArcSwap`; a reload builds and validates a complete replacement off the
//! request path, then swaps the pointer. In-flight requests hold their own
//! `Arc<Snapshot>` and keep serving against the old generation until they
//! finish, at which point the last reference drops it.
use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use url::Url;

use crate::{
    config::models::{Config, MatchKind, ResponseConfig, RouteConfig, RouteMatch, TargetConfig},
    core::{chain::Chain, plugin::Plugin, result_cache::PluginResultCache, router::RouteIndex},
};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("route '{route}': invalid target URL '{url}': {message}")]
    InvalidTarget {
        route: String,
        url: String,
        message: String,
    },

    #[error("route '{route}' references unavailable plugin '{plugin}'")]
    MissingPlugin { route: String, plugin: String },
}

/// A fully resolved route inside one snapshot.
pub struct Route {
    pub name: String,
    pub rule: RouteMatch,
    pub target: TargetConfig,
    /// Pre-parsed upstream URL; `None` for `internal://` targets.
    pub upstream: Option<Url>,
    pub response: Option<ResponseConfig>,
    pub plugins: Vec<String>,
    /// Declaration position, used to break priority ties deterministically.
    pub index: usize,
}

impl Route {
    fn resolve(config: &RouteConfig, index: usize) -> Result<Self, SnapshotError> {
        let upstream = if config.target.is_internal() {
            None
        } else {
            Some(Url::parse(&config.target.url).map_err(|e| {
                SnapshotError::InvalidTarget {
                    route: config.name.clone(),
                    url: config.target.url.clone(),
                    message: e.to_string(),
                }
            })?)
        };

        Ok(Self {
            name: config.name.clone(),
            rule: config.rule.clone(),
            target: config.target.clone(),
            upstream,
            response: config.response.clone(),
            plugins: config.plugins.clone(),
            index,
        })
    }

    pub fn is_internal(&self) -> bool {
        self.target.is_internal()
    }
}

/// One immutable generation of gateway state.
pub struct Snapshot {
    pub config: Arc<Config>,
    pub routes: Vec<Arc<Route>>,
    index: RouteIndex,
    chains: HashMap<String, Chain>,
}

impl Snapshot {
    /// Build a snapshot from a validated config and the planned plugin
    /// instance set. Fails closed: any unresolvable route or missing plugin
    /// aborts the build and the previous snapshot stays in service.
    pub fn build(
        config: Arc<Config>,
        available: &HashMap<String, Arc<dyn Plugin>>,
        result_cache: Arc<PluginResultCache>,
    ) -> Result<Self, SnapshotError> {
        let mut routes = Vec::with_capacity(config.routes.len());
        for (index, route_config) in config.routes.iter().enumerate() {
            routes.push(Arc::new(Route::resolve(route_config, index)?));
        }

        let mut chains = HashMap::new();
        for route in &routes {
            if route.plugins.is_empty() {
                continue;
            }
            let mut instances = Vec::with_capacity(route.plugins.len());
            for name in &route.plugins {
                let plugin =
                    available
                        .get(name)
                        .cloned()
                        .ok_or_else(|| SnapshotError::MissingPlugin {
                            route: route.name.clone(),
                            plugin: name.clone(),
                        })?;
                instances.push(plugin);
            }
            chains.insert(
                route.name.clone(),
                Chain::new(instances, result_cache.clone()),
            );
        }

        let index = RouteIndex::build(&routes);

        Ok(Self {
            config,
            routes,
            index,
            chains,
        })
    }

    pub fn index(&self) -> &RouteIndex {
        &self.index
    }

    pub fn chain(&self, route_name: &str) -> Option<&Chain> {
        self.chains.get(route_name)
    }
}

/// Whether the prefix should be stripped before forwarding: only prefix
/// matchers with a non-root path rewrite the upstream path.
pub fn strip_prefix(kind: MatchKind, matched_path: &str, request_path: &str) -> String {
    if kind != MatchKind::Prefix || matched_path == "/" {
        return request_path.to_string();
    }

    let stripped = request_path
        .strip_prefix(matched_path)
        .unwrap_or(request_path);
    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{stripped}")
    }
}
