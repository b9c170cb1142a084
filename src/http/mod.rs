//! HTTP plumbing: a single request/response exchange, retry with backoff,
//! and bearer-token authentication layered on top.

mod authenticated;
mod client;
mod retry;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthError;

pub use authenticated::AuthenticatedTransport;
pub use client::{HttpClient, odata_headers};
pub use retry::{
    Classification, DEFAULT_MAX_RETRIES, RetryPolicy, RetryState, RetryingTransport,
    classify_status, exponential_backoff, parse_retry_after,
};

/// An outbound request, independent of the HTTP stack that sends it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    /// JSON body, serialized at send time.
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            body: Some(body),
            ..Self::new(Method::POST, url)
        }
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
    /// Number of network attempts it took to obtain this response.
    pub attempts: u32,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: String::new(),
            attempts: 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// A failure below the HTTP layer: connect, reset, DNS, timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkError {
    pub message: String,
    pub timeout: bool,
}

impl NetworkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timeout: false,
        }
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.timeout {
            write!(f, "Request timed out: {}", self.message)
        } else {
            write!(f, "Network error: {}", self.message)
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            timeout: err.is_timeout(),
            message: err.to_string(),
        }
    }
}

/// Errors surfaced by a [`Transport`] once it has given up on a request.
#[derive(Debug)]
pub enum TransportError {
    /// Token acquisition failed; the request was never sent with credentials.
    Auth(AuthError),
    /// Every allowed attempt ended in a transient failure.
    Exhausted {
        /// Status of the last response, `None` when the last attempt failed at the network level.
        status: Option<StatusCode>,
        attempts: u32,
        message: String,
    },
    /// Cancellation was observed at a backoff boundary.
    Cancelled { attempts: u32 },
}

impl TransportError {
    /// Attempts made before the error was surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            TransportError::Auth(_) => 0,
            TransportError::Exhausted { attempts, .. } => *attempts,
            TransportError::Cancelled { attempts } => *attempts,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Auth(err) => write!(f, "{}", err),
            TransportError::Exhausted {
                status: Some(status),
                attempts,
                message,
            } => write!(
                f,
                "Giving up after {} attempts, last status {}: {}",
                attempts,
                status.as_u16(),
                message
            ),
            TransportError::Exhausted {
                status: None,
                attempts,
                message,
            } => write!(f, "Giving up after {} attempts: {}", attempts, message),
            TransportError::Cancelled { attempts } => {
                write!(f, "Cancelled after {} attempts", attempts)
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Auth(err) => Some(err),
            _ => None,
        }
    }
}

impl From<AuthError> for TransportError {
    fn from(err: AuthError) -> Self {
        TransportError::Auth(err)
    }
}

/// One request/response round trip over the network, no retries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpExchange: Send + Sync {
    async fn exchange(&self, request: &HttpRequest) -> Result<HttpResponse, NetworkError>;
}

/// Sends a request with whatever policy the implementation layers on top of
/// the raw exchange.
///
/// Non-success statuses that are not retried come back as `Ok`; callers
/// decide what a 4xx means for them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError>;

    /// Makes sure credentials are available before any request goes out.
    async fn authenticate(&self) -> Result<(), AuthError> {
        Ok(())
    }
}
