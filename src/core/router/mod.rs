//! Route matching engine.
//!
//! A snapshot builds one [`RouteIndex`] from its route list: a segment trie
//! for exact/prefix paths, a priority-ordered list as the authoritative
//! fallback, a bounded path→route cache and a memoizing pattern cache for
//! regex and wildcard matchers.
mod cache;
mod trie;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use regex::Regex;

pub use cache::{DEFAULT_CAPACITY, PathCache};
pub use trie::PathTrie;

use crate::{
    config::models::MatchKind,
    core::{context::RequestContext, snapshot::Route},
};

/// Translate a `*` wildcard pattern into an anchored regex.
pub fn wildcard_to_regex(pattern: &str) -> String {
    format!("^{}$", pattern.replace('*', ".*"))
}

/// Compiled-pattern cache. Hits take only the read lock; misses use a
/// double-checked insert under the write lock.
struct PatternCache {
    patterns: RwLock<HashMap<String, Arc<Regex>>>,
}

impl PatternCache {
    fn new() -> Self {
        Self {
            patterns: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, pattern: &str) -> Option<Arc<Regex>> {
        {
            let patterns = self.patterns.read().expect("pattern cache lock poisoned");
            if let Some(regex) = patterns.get(pattern) {
                return Some(regex.clone());
            }
        }

        let mut patterns = self.patterns.write().expect("pattern cache lock poisoned");
        if let Some(regex) = patterns.get(pattern) {
            return Some(regex.clone());
        }

        match Regex::new(pattern) {
            Ok(regex) => {
                let regex = Arc::new(regex);
                patterns.insert(pattern.to_string(), regex.clone());
                Some(regex)
            }
            Err(e) => {
                // Validation compiles every configured pattern, so this only
                // fires for patterns that raced past it; treat as no-match.
                tracing::warn!(pattern, error = %e, "failed to compile route pattern");
                None
            }
        }
    }
}

/// Produces the single winning route for a request, or none.
pub struct RouteIndex {
    trie: PathTrie,
    /// All routes, sorted by priority descending; the sort is stable so equal
    /// priorities keep declaration order.
    ordered: Vec<Arc<Route>>,
    cache: PathCache,
    patterns: PatternCache,
}

impl RouteIndex {
    pub fn build(routes: &[Arc<Route>]) -> Self {
        let mut trie = PathTrie::new();
        for route in routes {
            if matches!(route.rule.kind, MatchKind::Exact | MatchKind::Prefix) {
                trie.insert(route.clone());
            }
        }

        let mut ordered: Vec<Arc<Route>> = routes.to_vec();
        ordered.sort_by_key(|r| std::cmp::Reverse(r.rule.priority));

        Self {
            trie,
            ordered,
            cache: PathCache::new(DEFAULT_CAPACITY),
            patterns: PatternCache::new(),
        }
    }

    /// Match a request to its winning route: the highest-priority route whose
    /// full predicate set is satisfied, ties resolved by declaration order.
    pub fn find(&self, ctx: &RequestContext) -> Option<Arc<Route>> {
        let query = ctx.query_pairs();

        // Cached winner for this exact path, re-validated against the full
        // predicate set of the current request.
        if let Some(route) = self.cache.get(&ctx.path) {
            if self.matches(&route, ctx, &query) {
                return Some(route);
            }
        }

        // Trie candidates, best first by (priority, declaration order).
        let mut best: Option<Arc<Route>> = None;
        for candidate in self.trie.candidates(&ctx.path) {
            if !self.matches(&candidate, ctx, &query) {
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|current| Self::beats(&candidate, current))
            {
                best = Some(candidate);
            }
        }

        // Walk the ordered list only as far as routes that could still beat
        // the trie winner; this is where regex/wildcard routes and
        // non-segment-aligned prefixes are found.
        for route in &self.ordered {
            if let Some(current) = &best {
                if !Self::beats(route, current) {
                    break;
                }
            }
            if self.matches(route, ctx, &query) {
                best = Some(route.clone());
                break;
            }
        }

        if let Some(route) = &best {
            self.cache.insert(&ctx.path, route.clone());
        }
        best
    }

    /// Strict ordering: higher priority wins, then earlier declaration.
    fn beats(candidate: &Route, incumbent: &Route) -> bool {
        (candidate.rule.priority, std::cmp::Reverse(candidate.index))
            > (incumbent.rule.priority, std::cmp::Reverse(incumbent.index))
    }

    fn matches(
        &self,
        route: &Route,
        ctx: &RequestContext,
        query: &HashMap<String, String>,
    ) -> bool {
        if !self.matches_path(route, &ctx.path) {
            return false;
        }

        let rule = &route.rule;
        if let Some(host) = &rule.host {
            if ctx.host != *host {
                return false;
            }
        }

        if let Some(method) = &rule.method {
            if !ctx.method.as_str().eq_ignore_ascii_case(method) {
                return false;
            }
        }

        for (name, expected) in &rule.headers {
            if ctx.header(name) != Some(expected.as_str()) {
                return false;
            }
        }

        for (name, expected) in &rule.query_params {
            if query.get(name) != Some(expected) {
                return false;
            }
        }

        true
    }

    fn matches_path(&self, route: &Route, path: &str) -> bool {
        match route.rule.kind {
            MatchKind::Exact => path == route.rule.path,
            MatchKind::Prefix => path.starts_with(&route.rule.path),
            MatchKind::Regex => self
                .patterns
                .get(&route.rule.path)
                .is_some_and(|regex| regex.is_match(path)),
            MatchKind::Wildcard => self
                .patterns
                .get(&wildcard_to_regex(&route.rule.path))
                .is_some_and(|regex| regex.is_match(path)),
        }
    }
}
