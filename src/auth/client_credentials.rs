//! Client-credentials grant with a per-scope token cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;

use super::{AuthError, Credentials, Token, TokenProvider};

/// Tokens this close to expiry are treated as expired.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

type Slot = Arc<tokio::sync::Mutex<Option<Token>>>;

/// Acquires tokens with the OAuth2 client-credentials grant.
///
/// Each scope has its own async lock, so concurrent callers wait for a single
/// exchange instead of racing, while other scopes are unaffected.
pub struct ClientCredentialsProvider {
    client: Client,
    credentials: Credentials,
    safety_margin: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ClientCredentialsProvider {
    pub fn new(client: Client, credentials: Credentials) -> Self {
        Self {
            client,
            credentials,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_safety_margin(mut self, safety_margin: Duration) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn slot(&self, scope: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(scope.to_string()).or_default().clone()
    }

    fn validate_tenant(tenant: &str) -> Result<(), AuthError> {
        let invalid = tenant.is_empty()
            || tenant
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '\\'));
        if invalid {
            return Err(AuthError::InvalidTenant(tenant.to_string()));
        }
        Ok(())
    }

    /// Performs the credential exchange. No caching, no retries.
    #[tracing::instrument(skip(self))]
    async fn exchange(&self, scope: &str) -> Result<Token, AuthError> {
        Self::validate_tenant(&self.credentials.tenant_id)?;

        let endpoint = self.credentials.token_endpoint();
        debug!("Requesting token for {} from {}", scope, endpoint);

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", scope),
        ];

        let response = self
            .client
            .post(&endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        if !status.is_success() {
            let message = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {}", err.error, description),
                    None => err.error,
                },
                Err(_) => body,
            };
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(AuthError::MalformedResponse(
                "empty access_token".to_string(),
            ));
        }

        if Duration::from_secs(parsed.expires_in) <= self.safety_margin {
            warn!(
                "Token for {} expires in {}s, within the {}s safety margin",
                scope,
                parsed.expires_in,
                self.safety_margin.as_secs()
            );
        }

        Ok(Token::new(
            parsed.access_token,
            Duration::from_secs(parsed.expires_in),
            scope,
        ))
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsProvider {
    async fn acquire_token(&self, scope: &str) -> Result<Token, AuthError> {
        let slot = self.slot(scope);
        let mut cached = slot.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.is_fresh(self.safety_margin) {
                return Ok(token.clone());
            }
            debug!("Cached token for {} is about to expire, refreshing", scope);
        }

        let token = self.exchange(scope).await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn refresh_token(&self, scope: &str, stale: &Token) -> Result<Token, AuthError> {
        let slot = self.slot(scope);
        let mut cached = slot.lock().await;

        if let Some(token) = cached.as_ref() {
            if token != stale && token.is_fresh(self.safety_margin) {
                debug!("Token for {} was already refreshed", scope);
                return Ok(token.clone());
            }
        }

        warn!("Forcing token refresh for {}", scope);
        let token = self.exchange(scope).await?;
        *cached = Some(token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const SCOPE: &str = "https://org.crm.dynamics.com/.default";

    fn credentials(authority_host: String, tenant_id: &str) -> Credentials {
        Credentials {
            client_id: "my-client".to_string(),
            client_secret: "my-secret".to_string(),
            tenant_id: tenant_id.to_string(),
            authority_host,
            resource_url: "https://org.crm.dynamics.com".to_string(),
        }
    }

    fn token_body(token: &str, expires_in: u64) -> String {
        format!(
            r#"{{"token_type": "Bearer", "expires_in": {}, "access_token": "{}"}}"#,
            expires_in, token
        )
    }

    #[tokio::test]
    async fn test_acquire_token_sends_client_credentials_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
                Matcher::UrlEncoded("client_id".into(), "my-client".into()),
                Matcher::UrlEncoded("client_secret".into(), "my-secret".into()),
                Matcher::UrlEncoded("scope".into(), SCOPE.into()),
            ]))
            .with_status(200)
            .with_body(token_body("token-a", 3600))
            .create_async()
            .await;

        let provider =
            ClientCredentialsProvider::new(Client::new(), credentials(server.url(), "tenant-1"));
        let token = provider.acquire_token(SCOPE).await.unwrap();

        mock.assert_async().await;
        assert_eq!(token.value(), "token-a");
        assert_eq!(token.scope(), SCOPE);
    }

    #[tokio::test]
    async fn test_acquire_token_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body(token_body("token-a", 3600))
            .expect(1)
            .create_async()
            .await;

        let provider =
            ClientCredentialsProvider::new(Client::new(), credentials(server.url(), "tenant-1"));
        let first = provider.acquire_token(SCOPE).await.unwrap();
        let second = provider.acquire_token(SCOPE).await.unwrap();

        mock.assert_async().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_token_within_safety_margin_is_refreshed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body(token_body("short-lived", 30))
            .expect(2)
            .create_async()
            .await;

        let provider =
            ClientCredentialsProvider::new(Client::new(), credentials(server.url(), "tenant-1"));
        provider.acquire_token(SCOPE).await.unwrap();
        provider.acquire_token(SCOPE).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_exchange() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body(token_body("token-a", 3600))
            .expect(1)
            .create_async()
            .await;

        let provider = Arc::new(ClientCredentialsProvider::new(
            Client::new(),
            credentials(server.url(), "tenant-1"),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(async move {
                provider.acquire_token(SCOPE).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().value(), "token-a");
        }

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_scopes_are_cached_independently() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body(token_body("token-a", 3600))
            .expect(2)
            .create_async()
            .await;

        let provider =
            ClientCredentialsProvider::new(Client::new(), credentials(server.url(), "tenant-1"));
        let a = provider.acquire_token(SCOPE).await.unwrap();
        let b = provider
            .acquire_token("https://other.crm.dynamics.com/.default")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(a.scope(), SCOPE);
        assert_eq!(b.scope(), "https://other.crm.dynamics.com/.default");
    }

    #[tokio::test]
    async fn test_refresh_token_replaces_cached_token_once() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body(token_body("token-a", 3600))
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body(token_body("token-b", 3600))
            .expect(1)
            .create_async()
            .await;

        let provider =
            ClientCredentialsProvider::new(Client::new(), credentials(server.url(), "tenant-1"));
        let stale = provider.acquire_token(SCOPE).await.unwrap();
        let fresh = provider.refresh_token(SCOPE, &stale).await.unwrap();
        // A second caller holding the same stale token gets the replacement
        let again = provider.refresh_token(SCOPE, &stale).await.unwrap();
        let cached = provider.acquire_token(SCOPE).await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(stale.value(), "token-a");
        assert_eq!(fresh.value(), "token-b");
        assert_eq!(again, fresh);
        assert_eq!(cached, fresh);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refreshes_share_one_exchange() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body(token_body("token-a", 3600))
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body(token_body("token-b", 3600))
            .expect(1)
            .create_async()
            .await;

        let provider = Arc::new(ClientCredentialsProvider::new(
            Client::new(),
            credentials(server.url(), "tenant-1"),
        ));
        let stale = provider.acquire_token(SCOPE).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let provider = Arc::clone(&provider);
            let stale = stale.clone();
            tasks.spawn(async move { provider.refresh_token(SCOPE, &stale).await });
        }

        let mut refreshed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            refreshed.push(joined.unwrap().unwrap());
        }

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(refreshed.len(), 8);
        assert!(refreshed.iter().all(|t| t.value() == "token-b"));
    }

    #[tokio::test]
    async fn test_rejected_secret() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(401)
            .with_body(
                r#"{"error": "invalid_client", "error_description": "AADSTS7000215: Invalid client secret provided."}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let provider =
            ClientCredentialsProvider::new(Client::new(), credentials(server.url(), "tenant-1"));
        let err = provider.acquire_token(SCOPE).await.unwrap_err();

        mock.assert_async().await;
        match err {
            AuthError::Rejected { status, message } => {
                assert_eq!(status, 401);
                assert!(message.starts_with("invalid_client: AADSTS7000215"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_token_response() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(200)
            .with_body("<html>sign in</html>")
            .create_async()
            .await;

        let provider =
            ClientCredentialsProvider::new(Client::new(), credentials(server.url(), "tenant-1"));
        let err = provider.acquire_token(SCOPE).await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_authority() {
        let provider = ClientCredentialsProvider::new(
            Client::new(),
            credentials("http://127.0.0.1:1".to_string(), "tenant-1"),
        );
        let err = provider.acquire_token(SCOPE).await.unwrap_err();
        assert!(matches!(err, AuthError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_malformed_tenant_fails_without_network() {
        for tenant in ["", "a/b", "has space", "x?y"] {
            let provider = ClientCredentialsProvider::new(
                Client::new(),
                credentials("http://127.0.0.1:1".to_string(), tenant),
            );
            let err = provider.acquire_token(SCOPE).await.unwrap_err();
            assert_eq!(err, AuthError::InvalidTenant(tenant.to_string()));
        }
    }

    #[test]
    fn test_validate_tenant() {
        assert!(ClientCredentialsProvider::validate_tenant("contoso.onmicrosoft.com").is_ok());
        assert!(
            ClientCredentialsProvider::validate_tenant("72f988bf-86f1-41af-91ab-2d7cd011db47")
                .is_ok()
        );
        assert!(ClientCredentialsProvider::validate_tenant("a\\b").is_err());
    }
}
