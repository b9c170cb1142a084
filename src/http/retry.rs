//! Retry logic for throttled and flaky requests with server-directed backoff.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tokio_util::sync::CancellationToken;

use super::{HttpExchange, HttpRequest, HttpResponse, Transport, TransportError};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// How an exchange outcome should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Expected to succeed if tried again.
    Transient,
    /// Returned to the caller as is.
    Terminal,
}

/// Classifies a response status.
///
/// Throttling (429) and the gateway/availability family of 5xx codes are
/// transient. Everything else, including other 4xx and 5xx, is terminal.
pub fn classify_status(status: StatusCode) -> Classification {
    match status {
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Classification::Transient,
        _ => Classification::Terminal,
    }
}

/// Reads `Retry-After` as a whole number of seconds.
///
/// HTTP-date values and garbage yield `None`, which falls back to the
/// policy's backoff.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// `2^attempt` seconds, attempt counted from 0.
pub fn exponential_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
}

/// Retry parameters for [`RetryingTransport`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the next attempt when the server gives no `Retry-After`.
    pub backoff: fn(u32) -> Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: exponential_backoff,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retrying after `attempt` failed. The server's hint wins.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| (self.backoff)(attempt))
    }
}

/// Bookkeeping for one logical request's retry loop.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Zero-based index of the attempt that just failed.
    pub attempt: u32,
    pub last_status: Option<StatusCode>,
    pub next_delay: Duration,
}

/// Retries transient failures of an inner [`HttpExchange`].
pub struct RetryingTransport<E> {
    exchange: E,
    policy: RetryPolicy,
}

impl<E: HttpExchange> RetryingTransport<E> {
    pub fn new(exchange: E, policy: RetryPolicy) -> Self {
        Self { exchange, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Sends `request`, retrying per policy.
    ///
    /// Terminal statuses are returned as `Ok` with the attempt count filled in.
    pub async fn send_with_retry(
        &self,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        self.send_with_retry_from(request, cancel, 0).await
    }

    /// Like [`send_with_retry`](Self::send_with_retry), for a logical request
    /// that already used `spent_retries` of its budget in an earlier leg.
    ///
    /// Attempt counts in the result cover this call only.
    #[tracing::instrument(skip(self, request, cancel), fields(method = %request.method, url = %request.url))]
    pub async fn send_with_retry_from(
        &self,
        request: &HttpRequest,
        cancel: &CancellationToken,
        spent_retries: u32,
    ) -> Result<HttpResponse, TransportError> {
        let mut state = RetryState {
            attempt: spent_retries,
            ..RetryState::default()
        };
        let mut attempts = 0;

        loop {
            attempts += 1;
            let outcome = self.exchange.exchange(request).await;

            let (retry_after, last_message) = match outcome {
                Ok(mut response) => {
                    if classify_status(response.status) == Classification::Terminal {
                        response.attempts = attempts;
                        return Ok(response);
                    }
                    state.last_status = Some(response.status);
                    (parse_retry_after(&response.headers), response.body)
                }
                Err(err) => {
                    state.last_status = None;
                    (None, err.to_string())
                }
            };

            if state.attempt >= self.policy.max_retries {
                tracing::warn!(
                    status = state.last_status.map(|s| s.as_u16()),
                    attempts,
                    "{} {}: giving up",
                    request.method,
                    request.url
                );
                return Err(TransportError::Exhausted {
                    status: state.last_status,
                    attempts,
                    message: last_message,
                });
            }

            state.next_delay = self.policy.delay_for(state.attempt, retry_after);
            tracing::warn!(
                status = state.last_status.map(|s| s.as_u16()),
                delay_ms = state.next_delay.as_millis() as u64,
                attempt = state.attempt + 1,
                max_attempts = self.policy.max_retries + 1,
                "{} {}: transient failure, retrying",
                request.method,
                request.url
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("{} {}: cancelled during backoff", request.method, request.url);
                    return Err(TransportError::Cancelled { attempts });
                }
                _ = tokio::time::sleep(state.next_delay) => {}
            }

            state.attempt += 1;
        }
    }
}

#[async_trait]
impl<E: HttpExchange> Transport for RetryingTransport<E> {
    async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        self.send_with_retry(&request, cancel).await
    }
}
