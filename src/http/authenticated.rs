//! Bearer-token authentication on top of [`RetryingTransport`].

use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use tokio_util::sync::CancellationToken;

use super::{HttpExchange, HttpRequest, HttpResponse, RetryingTransport, Transport, TransportError};
use crate::auth::{AuthError, Token, TokenProvider};

/// Attaches a bearer token to every request and re-authenticates once when
/// the server answers 401.
///
/// The re-sent request only gets the retries the first leg left unused, so a
/// logical request never exceeds the policy's retry count.
pub struct AuthenticatedTransport<E> {
    tokens: Arc<dyn TokenProvider>,
    scope: String,
    inner: RetryingTransport<E>,
}

impl<E: HttpExchange> AuthenticatedTransport<E> {
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        scope: impl Into<String>,
        inner: RetryingTransport<E>,
    ) -> Self {
        Self {
            tokens,
            scope: scope.into(),
            inner,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn authorize(request: &mut HttpRequest, token: &Token) -> Result<(), TransportError> {
        let mut value = HeaderValue::from_str(&token.bearer()).map_err(|_| {
            TransportError::Auth(AuthError::MalformedResponse(
                "access token is not a valid header value".to_string(),
            ))
        })?;
        value.set_sensitive(true);
        request.headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}

#[async_trait]
impl<E: HttpExchange> Transport for AuthenticatedTransport<E> {
    #[tracing::instrument(skip(self, request, cancel), fields(method = %request.method, url = %request.url))]
    async fn send(
        &self,
        mut request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let token = self.tokens.acquire_token(&self.scope).await?;
        Self::authorize(&mut request, &token)?;

        let response = self.inner.send_with_retry(&request, cancel).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(
            "{} {}: 401 Unauthorized, re-authenticating",
            request.method, request.url
        );
        let fresh = self.tokens.refresh_token(&self.scope, &token).await?;
        Self::authorize(&mut request, &fresh)?;

        // A second 401 is returned as is
        let spent = response.attempts.saturating_sub(1);
        let retried = self.inner.send_with_retry_from(&request, cancel, spent).await;
        let mut retried = match retried {
            Ok(retried) => retried,
            Err(TransportError::Exhausted {
                status,
                attempts,
                message,
            }) => {
                return Err(TransportError::Exhausted {
                    status,
                    attempts: attempts + response.attempts,
                    message,
                });
            }
            Err(TransportError::Cancelled { attempts }) => {
                return Err(TransportError::Cancelled {
                    attempts: attempts + response.attempts,
                });
            }
            Err(err) => return Err(err),
        };
        retried.attempts += response.attempts;
        Ok(retried)
    }

    async fn authenticate(&self) -> Result<(), AuthError> {
        self.tokens.acquire_token(&self.scope).await.map(|_| ())
    }
}
