//! Plugin registry: the catalog of plugin factories and the live instance
//! set, with reuse-by-config across reloads.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    config::models::PluginDecl,
    core::{
        plugin::{Plugin, PluginError},
        plugins,
    },
};

struct LiveInstance {
    fingerprint: String,
    plugin: Arc<dyn Plugin>,
}

/// The outcome of planning a new generation of plugin instances against a
/// fresh configuration. Nothing is committed until the snapshot swap
/// succeeds: on abort, `created` instances are stopped and discarded; on
/// commit, `retired` instances are stopped after the swap.
pub struct GenerationPlan {
    pub available: HashMap<String, Arc<dyn Plugin>>,
    pub created: Vec<Arc<dyn Plugin>>,
    pub retired: Vec<Arc<dyn Plugin>>,
    fingerprints: HashMap<String, String>,
}

/// Process-wide plugin registry.
pub struct PluginRegistry {
    live: Mutex<HashMap<String, LiveInstance>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Serialized form of a declaration's config bag; instances are reused
    /// across reloads iff this is byte-equal.
    fn fingerprint(decl: &PluginDecl) -> String {
        serde_json::to_string(&decl.config).unwrap_or_default()
    }

    /// Build the instance set for `decls`, reusing live instances whose name
    /// and serialized config are unchanged. Disabled declarations are
    /// skipped; their live instances (if any) are retired.
    pub fn plan(&self, decls: &[PluginDecl]) -> Result<GenerationPlan, PluginError> {
        let live = self.live.lock().expect("registry lock poisoned");

        let mut available = HashMap::new();
        let mut created: Vec<Arc<dyn Plugin>> = Vec::new();
        let mut fingerprints = HashMap::new();

        // Sort by order for deterministic construction; chains re-sort on
        // their own so this only affects error reporting order.
        let mut sorted: Vec<&PluginDecl> = decls.iter().filter(|d| d.enabled).collect();
        sorted.sort_by_key(|d| d.order);

        for decl in sorted {
            let fingerprint = Self::fingerprint(decl);

            let instance = match live.get(&decl.name) {
                Some(existing)
                    if existing.fingerprint == fingerprint
                        && existing.plugin.order() == decl.order =>
                {
                    existing.plugin.clone()
                }
                _ => {
                    let built = plugins::build(decl).inspect_err(|_| {
                        // Abort cleanly: stop anything we already built so
                        // their janitors do not leak.
                        for plugin in &created {
                            plugin.stop();
                        }
                    })?;
                    created.push(built.clone());
                    built
                }
            };

            fingerprints.insert(decl.name.clone(), fingerprint);
            available.insert(decl.name.clone(), instance);
        }

        let retired = live
            .values()
            .filter(|existing| {
                available
                    .get(existing.plugin.name())
                    .is_none_or(|replacement| !Arc::ptr_eq(replacement, &existing.plugin))
            })
            .map(|existing| existing.plugin.clone())
            .collect();

        Ok(GenerationPlan {
            available,
            created,
            retired,
            fingerprints,
        })
    }

    /// Make the planned generation live. Returns the retired instances; the
    /// caller stops them after the snapshot swap so in-flight requests on the
    /// old snapshot never see a stopped plugin mid-chain.
    pub fn commit(&self, plan: GenerationPlan) -> Vec<Arc<dyn Plugin>> {
        let mut live = self.live.lock().expect("registry lock poisoned");
        *live = plan
            .available
            .iter()
            .map(|(name, plugin)| {
                (
                    name.clone(),
                    LiveInstance {
                        fingerprint: plan.fingerprints.get(name).cloned().unwrap_or_default(),
                        plugin: plugin.clone(),
                    },
                )
            })
            .collect();
        plan.retired
    }

    /// Discard a plan whose snapshot build failed, stopping any instances
    /// that were created for it.
    pub fn abort(&self, plan: GenerationPlan) {
        for plugin in &plan.created {
            plugin.stop();
        }
    }

    /// Stop every live instance. Called once at shutdown.
    pub fn shutdown(&self) {
        let mut live = self.live.lock().expect("registry lock poisoned");
        for instance in live.values() {
            instance.plugin.stop();
        }
        live.clear();
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
