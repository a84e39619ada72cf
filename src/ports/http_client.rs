use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use http::StatusCode;
use hyper::{Request, Response};
use thiserror::Error;

/// Errors surfaced by the outbound HTTP client.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Connecting to or talking to the backend failed at the transport level.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// The request did not complete within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The outbound request could not be constructed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Port for the outbound proxy transport.
///
/// The gateway core decides *which* backend is targeted and what to record
/// about the outcome; the implementation owns connections, pooling and TLS.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Forward a fully-prepared request (absolute URI, rewritten headers) to
    /// its backend and stream back the response.
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;

    /// Issue a health probe and return the response status. Never follows
    /// redirects; transport failures map to `Err`.
    async fn probe(&self, url: &str, timeout: Duration) -> HttpClientResult<StatusCode>;
}
