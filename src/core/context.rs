//! Per-request context shared by the dispatcher and the plugin chain.
use std::{collections::HashMap, net::IpAddr, sync::Arc};

use axum::body::Body;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, request::Parts};

/// Observes the final response status of a request. Plugins that need to see
/// the outcome after the chain and the proxy complete (the circuit breaker)
/// register one of these; the dispatcher notifies them in insertion order.
pub trait ResponseObserver: Send + Sync {
    fn observe(&self, status: StatusCode);
}

/// Mutable per-request state handed to every plugin in the chain.
///
/// The request body is intentionally not part of the context: plugins operate
/// on metadata only, and the body is streamed to the upstream untouched.
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub raw_query: String,
    pub host: String,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
    pub request_id: String,
    /// The matched route's target URL, published by the dispatcher before the
    /// chain runs.
    pub target: Option<String>,
    values: HashMap<String, String>,
    response_headers: Vec<(HeaderName, HeaderValue)>,
    observers: Vec<Arc<dyn ResponseObserver>>,
}

impl RequestContext {
    pub fn from_parts(parts: &Parts, client_ip: Option<IpAddr>, request_id: String) -> Self {
        let host = parts
            .headers
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            raw_query: parts.uri.query().unwrap_or_default().to_string(),
            host,
            headers: parts.headers.clone(),
            client_ip,
            request_id,
            target: None,
            values: HashMap::new(),
            response_headers: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// Fetch a request header as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Publish a context key. Keys prefixed `plugin_result_<name>` are
    /// captured by the chain's memoization cache after the plugin runs.
    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// All published keys starting with `prefix`, cloned for caching.
    pub fn values_with_prefix(&self, prefix: &str) -> HashMap<String, String> {
        self.values
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn restore_values(&mut self, values: &HashMap<String, String>) {
        for (k, v) in values {
            self.values.insert(k.clone(), v.clone());
        }
    }

    /// Stage a header to be applied to whatever response ends the request
    /// (used by CORS on non-preflight requests).
    pub fn stage_response_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.push((name, value));
    }

    pub fn add_observer(&mut self, observer: Arc<dyn ResponseObserver>) {
        self.observers.push(observer);
    }

    /// Apply staged headers and notify observers of the final status, in
    /// insertion order. Called exactly once by the dispatcher.
    pub fn finalize(&self, mut response: http::Response<Body>) -> http::Response<Body> {
        for (name, value) in &self.response_headers {
            response.headers_mut().insert(name.clone(), value.clone());
        }
        for observer in &self.observers {
            observer.observe(response.status());
        }
        response
    }

    /// Parsed query pairs; repeated keys keep their first value, matching the
    /// route predicate semantics.
    pub fn query_pairs(&self) -> HashMap<String, String> {
        let mut pairs = HashMap::new();
        for (k, v) in url::form_urlencoded::parse(self.raw_query.as_bytes()) {
            pairs.entry(k.into_owned()).or_insert_with(|| v.into_owned());
        }
        pairs
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a context directly from pieces, for unit tests.
    pub fn context(method: Method, path: &str, query: &str, host: &str) -> RequestContext {
        let mut builder = http::Request::builder()
            .method(method)
            .uri(if query.is_empty() {
                format!("http://{host}{path}")
            } else {
                format!("http://{host}{path}?{query}")
            });
        builder = builder.header(http::header::HOST, host);
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        RequestContext::from_parts(&parts, Some("127.0.0.1".parse().unwrap()), "test".into())
    }
}
