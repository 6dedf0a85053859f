use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the upstream fails or breaks mid-exchange
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The request body overran the configured ceiling while being forwarded
    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Body error raised once a request body grows past its ceiling.
///
/// Carried as the source of whatever transport error the overrun surfaces as,
/// so callers can recover the limit that was hit.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("request body exceeds {limit} bytes")]
pub struct BodyLimitExceeded {
    pub limit: u64,
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to upstreams
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to an upstream server
    ///
    /// # Arguments
    /// * `req` - The HTTP request to send, with an absolute URI
    ///
    /// # Returns
    /// A future that resolves to the upstream's response (body still streaming)
    /// or an error when no response could be obtained
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
