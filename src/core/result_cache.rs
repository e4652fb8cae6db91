//! Memoization cache for plugin results.
//!
//! Keyed by a deterministic fingerprint of the plugin name plus a fixed
//! subset of request attributes. The cache only ever holds the context keys a
//! plugin published under its `plugin_result_<name>` prefix, so plugins that
//! must run on every request (CORS, the rate limiter) simply publish nothing
//! and stay uncacheable. Entries must not depend on the request body: the
//! fingerprint deliberately excludes it, which is a precondition for marking
//! any future plugin cacheable.
use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

use md5::{Digest, Md5};

use crate::core::context::RequestContext;

/// Headers that participate in the fingerprint, in a fixed order.
const FINGERPRINT_HEADERS: [&str; 3] = ["Authorization", "Content-Type", "User-Agent"];

pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

struct CacheEntry {
    payload: HashMap<String, String>,
    expires_at: Instant,
}

/// Process-wide plugin result cache with a global TTL.
pub struct PluginResultCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl PluginResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Deterministic fingerprint of plugin name, method, host, path, raw
    /// query and the fixed header subset.
    pub fn fingerprint(plugin_name: &str, ctx: &RequestContext) -> String {
        let mut data = serde_json::Map::new();
        data.insert("plugin".into(), plugin_name.into());
        data.insert("method".into(), ctx.method.as_str().into());
        data.insert("host".into(), ctx.host.as_str().into());
        data.insert("path".into(), ctx.path.as_str().into());
        data.insert("query".into(), ctx.raw_query.as_str().into());
        for header in FINGERPRINT_HEADERS {
            if let Some(value) = ctx.header(header) {
                data.insert(header.into(), value.into());
            }
        }

        let encoded = serde_json::to_vec(&data).unwrap_or_default();
        let mut hasher = Md5::new();
        hasher.update(&encoded);
        hex::encode(hasher.finalize())
    }

    pub fn lookup(&self, key: &str) -> Option<HashMap<String, String>> {
        let entries = self.entries.read().expect("result cache lock poisoned");
        let entry = entries.get(key)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.payload.clone())
    }

    pub fn store(&self, key: String, payload: HashMap<String, String>) {
        let mut entries = self.entries.write().expect("result cache lock poisoned");
        entries.insert(
            key,
            CacheEntry {
                payload,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop expired entries. Driven by a janitor task on the TTL period.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().expect("result cache lock poisoned");
        entries.retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().expect("result cache lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::*;
    use crate::core::context::test_support::context;

    #[test]
    fn fingerprint_is_deterministic_and_header_sensitive() {
        let ctx = context(Method::GET, "/api", "a=1", "example.com");
        let fp1 = PluginResultCache::fingerprint("interface_auth", &ctx);
        let fp2 = PluginResultCache::fingerprint("interface_auth", &ctx);
        assert_eq!(fp1, fp2);

        let mut other = context(Method::GET, "/api", "a=1", "example.com");
        other
            .headers
            .insert(http::header::AUTHORIZATION, "Bearer T".parse().unwrap());
        let fp3 = PluginResultCache::fingerprint("interface_auth", &other);
        assert_ne!(fp1, fp3);

        let fp4 = PluginResultCache::fingerprint("consistency", &ctx);
        assert_ne!(fp1, fp4);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = PluginResultCache::new(Duration::from_millis(0));
        cache.store(
            "k".into(),
            HashMap::from([("plugin_result_x".to_string(), "1".to_string())]),
        );
        assert!(cache.lookup("k").is_none());

        let cache = PluginResultCache::new(Duration::from_secs(60));
        cache.store(
            "k".into(),
            HashMap::from([("plugin_result_x".to_string(), "1".to_string())]),
        );
        assert!(cache.lookup("k").is_some());
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let cache = PluginResultCache::new(Duration::from_secs(60));
        cache.store("live".into(), HashMap::new());
        {
            let mut entries = cache.entries.write().unwrap();
            entries.insert(
                "dead".into(),
                CacheEntry {
                    payload: HashMap::new(),
                    expires_at: Instant::now() - Duration::from_secs(1),
                },
            );
        }
        cache.sweep();
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("live").is_some());
    }
}
