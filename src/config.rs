use std::sync::Arc;

use anyhow::{Context, Result, bail};
use log::debug;
use reqwest::{Client, Url};

use crate::auth::{ClientCredentialsProvider, Credentials, DEFAULT_AUTHORITY_HOST};
use crate::bulk::BulkExecutor;
use crate::http::{
    AuthenticatedTransport, DEFAULT_MAX_RETRIES, HttpClient, RetryPolicy, RetryingTransport,
    Transport, odata_headers,
};
use crate::webapi::WebApiClient;

pub const DEFAULT_API_VERSION: &str = "v9.2";

/// Connection settings for one environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Environment URL, e.g. `https://org.crm.dynamics.com`
    pub url: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub authority_host: String,
    pub api_version: String,
    pub max_retries: u32,
}

impl Settings {
    pub fn new(
        url: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Checks that both URLs parse and that no value is blank.
    pub fn validate(&self) -> Result<()> {
        parse_http_url(&self.url).context("Invalid environment URL")?;
        parse_http_url(&self.authority_host).context("Invalid authority host")?;
        for (name, value) in [
            ("tenant id", &self.tenant_id),
            ("client id", &self.client_id),
            ("client secret", &self.client_secret),
            ("API version", &self.api_version),
        ] {
            if value.trim().is_empty() {
                bail!("The {} must not be empty", name);
            }
        }
        Ok(())
    }

    /// `{url}/api/data/{api_version}`
    pub fn base_url(&self) -> String {
        format!(
            "{}/api/data/{}",
            self.url.trim_end_matches('/'),
            self.api_version
        )
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            tenant_id: self.tenant_id.clone(),
            authority_host: self.authority_host.clone(),
            resource_url: self.url.trim_end_matches('/').to_string(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_retries(self.max_retries)
    }

    /// The reqwest client shared by token requests and Web API calls.
    pub fn build_client(&self) -> Result<Client> {
        let client = Client::builder()
            .user_agent("dvbulk-cli")
            .default_headers(odata_headers())
            .build()?;
        Ok(client)
    }

    /// Wires the token provider and both transport layers around one client.
    pub fn connect(&self) -> Result<Connection> {
        self.validate()?;

        let client = self.build_client()?;
        let credentials = self.credentials();
        let scope = credentials.default_scope();
        debug!(
            "Connecting to {} as client {} (scope {})",
            self.base_url(),
            self.client_id,
            scope
        );

        let tokens = Arc::new(ClientCredentialsProvider::new(client.clone(), credentials));
        let retrying = RetryingTransport::new(HttpClient::new(client), self.retry_policy());
        let transport: Arc<dyn Transport> =
            Arc::new(AuthenticatedTransport::new(tokens, scope, retrying));

        Ok(Connection {
            executor: BulkExecutor::new(Arc::clone(&transport), self.base_url()),
            web_api: WebApiClient::new(transport, self.base_url()),
        })
    }
}

fn parse_http_url(value: &str) -> Result<Url> {
    let url = Url::parse(value).with_context(|| format!("'{}' is not a URL", value))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        bail!("'{}' must use http or https", value);
    }
    Ok(url)
}

/// Everything needed to talk to one environment.
#[derive(Clone)]
pub struct Connection {
    pub executor: BulkExecutor,
    pub web_api: WebApiClient,
}
