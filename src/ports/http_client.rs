use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for upstream HTTP operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the upstream call exceeds the route timeout
    #[error("Timeout after {0} ms")]
    Timeout(u128),

    /// Error when the outgoing request is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for upstream HTTP operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to
/// upstream services. The response body is streamed, not buffered.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to an upstream server.
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;
}
