//! OAuth2 bearer tokens for the Web API.
//!
//! Tokens are obtained with the client-credentials grant and cached per scope
//! by [`ClientCredentialsProvider`].

mod client_credentials;

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

pub use client_credentials::{ClientCredentialsProvider, DEFAULT_SAFETY_MARGIN};

/// Default Microsoft identity platform authority.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Service identity used for the client-credentials grant.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    /// Authority base URL, e.g. `https://login.microsoftonline.com`.
    pub authority_host: String,
    /// Resource the token is requested for, e.g. `https://org.crm.dynamics.com`.
    pub resource_url: String,
}

impl Credentials {
    /// The `.default` scope for the configured resource.
    pub fn default_scope(&self) -> String {
        format!("{}/.default", self.resource_url.trim_end_matches('/'))
    }

    pub fn token_endpoint(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field("authority_host", &self.authority_host)
            .field("resource_url", &self.resource_url)
            .finish()
    }
}

/// A bearer token for one scope.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    expires_at: Instant,
    scope: String,
}

impl Token {
    pub fn new(value: impl Into<String>, expires_in: Duration, scope: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: Instant::now() + expires_in,
            scope: scope.into(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whether the token stays valid for at least `margin` from now.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        match self.expires_at.checked_sub(margin) {
            Some(deadline) => Instant::now() < deadline,
            None => false,
        }
    }

    /// `Bearer <token>` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown: String = self.value.chars().take(4).collect();
        f.debug_struct("Token")
            .field("value", &format!("{}*********", shown))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Credential exchange failures. Never retried by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Tenant id cannot form a valid authority URL.
    InvalidTenant(String),
    /// Authority could not be reached.
    Unreachable(String),
    /// Authority answered with an error (bad secret, unknown client, ...).
    Rejected { status: u16, message: String },
    /// Authority answered 2xx with something that is not a token.
    MalformedResponse(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidTenant(tenant) => {
                write!(f, "Authentication failed: invalid tenant id '{}'", tenant)
            }
            AuthError::Unreachable(msg) => {
                write!(f, "Authentication failed: authority unreachable: {}", msg)
            }
            AuthError::Rejected { status, message } => {
                write!(
                    f,
                    "Authentication failed: authority returned HTTP {}: {}. Check the client id and secret.",
                    status, message
                )
            }
            AuthError::MalformedResponse(msg) => {
                write!(f, "Authentication failed: malformed token response: {}", msg)
            }
        }
    }
}

impl std::error::Error for AuthError {}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a token for `scope`, from cache while it is fresh.
    async fn acquire_token(&self, scope: &str) -> Result<Token, AuthError>;

    /// Replaces `stale` with a newly exchanged token.
    ///
    /// If another caller already replaced it, the cached replacement is
    /// returned without a new exchange.
    async fn refresh_token(&self, scope: &str, stale: &Token) -> Result<Token, AuthError>;
}
