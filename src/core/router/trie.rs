//! Segment trie over route paths.
//!
//! Exact and prefix routes are inserted by their `/`-separated segments.
//! Lookup walks the request path and collects candidates: prefix routes at
//! any node passed through, every route at the final node. The trie is an
//! accelerator only; the priority-ordered route list remains authoritative
//! for regex/wildcard matchers and for string-prefix matches that do not
//! fall on a segment boundary.
use std::{collections::HashMap, sync::Arc};

use crate::{config::models::MatchKind, core::snapshot::Route};

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    routes: Vec<Arc<Route>>,
}

pub struct PathTrie {
    root: TrieNode,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.trim_matches('/').split('/')
}

impl PathTrie {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
        }
    }

    pub fn insert(&mut self, route: Arc<Route>) {
        let mut node = &mut self.root;
        for part in segments(&route.rule.path) {
            node = node.children.entry(part.to_string()).or_default();
        }
        node.routes.push(route);
    }

    /// All routes whose trie position makes them path-candidates for
    /// `path`. Predicate evaluation is the caller's job.
    pub fn candidates(&self, path: &str) -> Vec<Arc<Route>> {
        let mut found = Vec::new();
        let mut node = &self.root;
        let mut parts = segments(path).peekable();

        while let Some(part) = parts.next() {
            let Some(child) = node.children.get(part) else {
                return found;
            };
            node = child;

            if parts.peek().is_some() {
                // Interior terminal: only prefix routes match a longer path.
                found.extend(
                    node.routes
                        .iter()
                        .filter(|r| r.rule.kind == MatchKind::Prefix)
                        .cloned(),
                );
            } else {
                found.extend(node.routes.iter().cloned());
            }
        }

        found
    }
}

impl Default for PathTrie {
    fn default() -> Self {
        Self::new()
    }
}
