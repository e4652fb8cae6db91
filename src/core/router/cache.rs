//! Bounded path→route cache.
//!
//! Approximate LRU: a full cache evicts one arbitrary entry on insert, which
//! keeps the hot path to a single read lock. Cache hits are re-validated
//! against the route's non-path predicates by the index before being served.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::core::snapshot::Route;

pub const DEFAULT_CAPACITY: usize = 1024;

pub struct PathCache {
    entries: RwLock<HashMap<String, Arc<Route>>>,
    capacity: usize,
}

impl PathCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn get(&self, path: &str) -> Option<Arc<Route>> {
        self.entries
            .read()
            .expect("path cache lock poisoned")
            .get(path)
            .cloned()
    }

    pub fn insert(&self, path: &str, route: Arc<Route>) {
        let mut entries = self.entries.write().expect("path cache lock poisoned");
        if entries.len() >= self.capacity && !entries.contains_key(path) {
            if let Some(evict) = entries.keys().next().cloned() {
                entries.remove(&evict);
            }
        }
        entries.insert(path.to_string(), route);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().expect("path cache lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::models::MatchKind, core::snapshot::test_support::route_with};

    #[test]
    fn insert_and_get() {
        let cache = PathCache::new(4);
        let route = route_with("api", MatchKind::Prefix, "/api", 10);
        cache.insert("/api/users", route.clone());
        assert!(Arc::ptr_eq(&cache.get("/api/users").unwrap(), &route));
        assert!(cache.get("/other").is_none());
    }

    #[test]
    fn eviction_keeps_capacity_bounded() {
        let cache = PathCache::new(2);
        for i in 0..10 {
            cache.insert(
                &format!("/p/{i}"),
                route_with("api", MatchKind::Prefix, "/p", 10),
            );
        }
        assert!(cache.len() <= 2);
    }
}
