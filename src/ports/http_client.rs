use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, StatusCode};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to a backend server.
    ///
    /// The request URI is absolute. A `Host` header already present on the
    /// request is kept; otherwise the URI authority is used.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// Issue a health probe and return the status code the backend answered with.
    ///
    /// # Arguments
    /// * `url` - The URL to probe
    /// * `timeout` - How long to wait for the response head
    async fn probe(&self, url: &str, timeout: Duration) -> HttpClientResult<StatusCode>;
}
