//! OData Web API addressing and the identity endpoint.

mod entity_id;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, bail};
use log::debug;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use reqwest::header::HeaderMap;

use crate::http::{HttpRequest, Transport};

pub use entity_id::{ODATA_ENTITY_ID, entity_id_from_headers, extract_entity_id};

/// Response of the `WhoAmI` function.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WhoAmIResponse {
    pub business_unit_id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
}

/// Response header carrying the service's recommended degree of parallelism.
pub const DOP_HINT_HEADER: &str = "x-ms-dop-hint";

/// Reads [`DOP_HINT_HEADER`]. Zero and non-numeric values are ignored.
pub fn parse_dop_hint(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(DOP_HINT_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|hint| *hint > 0)
}

/// `{base}/{collection}`
pub fn collection_url(base_url: &str, collection: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), collection)
}

/// `{base}/{collection}({id})`
pub fn entity_url(base_url: &str, collection: &str, id: &Uuid) -> String {
    format!("{}({})", collection_url(base_url, collection), id)
}

/// Thin client for calls outside the bulk executor.
#[derive(Clone)]
pub struct WebApiClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    /// Last parallelism hint seen, 0 when none
    dop_hint: Arc<AtomicUsize>,
}

impl WebApiClient {
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            dop_hint: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Parallelism the service recommended on the last `WhoAmI` call.
    pub fn recommended_degree_of_parallelism(&self) -> Option<usize> {
        match self.dop_hint.load(Ordering::Relaxed) {
            0 => None,
            hint => Some(hint),
        }
    }

    /// Identity of the calling application user.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn who_am_i(&self, cancel: &CancellationToken) -> Result<WhoAmIResponse> {
        let url = collection_url(&self.base_url, "WhoAmI");
        debug!("GET {}", url);

        let response = self
            .transport
            .send(HttpRequest::get(url), cancel)
            .await
            .context("Failed to call WhoAmI")?;

        if !response.is_success() {
            bail!(
                "WhoAmI failed with HTTP {}: {}",
                response.status.as_u16(),
                response.body
            );
        }

        if let Some(hint) = parse_dop_hint(&response.headers) {
            debug!("Service recommends {} parallel requests", hint);
            self.dop_hint.store(hint, Ordering::Relaxed);
        }

        serde_json::from_str(&response.body).context("Failed to parse WhoAmI response")
    }
}
