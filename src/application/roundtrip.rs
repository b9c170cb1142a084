//! Round trip - create a batch of records, then delete every one that came
//! back with an id.

use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::bulk::{BatchReport, BulkExecutor, Operation, Record};
use crate::webapi::WebApiClient;

/// Concurrency when neither the caller nor the service picks one.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Options for a round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTripOptions {
    /// Entity set name, e.g. `accounts`
    pub collection: String,
    /// Number of records to create
    pub count: usize,
    /// Upper bound on in-flight requests per phase, `None` to follow the
    /// service's recommendation
    pub max_concurrency: Option<usize>,
    /// Attribute that receives the generated value
    pub field: String,
    /// Generated values are `"{prefix} {i}"`
    pub prefix: String,
}

impl Default for RoundTripOptions {
    fn default() -> Self {
        Self {
            collection: "accounts".to_string(),
            count: 10,
            max_concurrency: None,
            field: "name".to_string(),
            prefix: "Record".to_string(),
        }
    }
}

impl RoundTripOptions {
    /// Record number `index` of the create phase.
    pub fn record(&self, index: usize) -> Record {
        let mut record = Record::new();
        record.insert(
            self.field.clone(),
            json!(format!("{} {}", self.prefix, index)),
        );
        record
    }
}

/// Result of a round trip
#[derive(Debug, Clone)]
pub struct RoundTripSummary {
    pub created: BatchReport,
    pub deleted: BatchReport,
    /// Records created without a usable id; they cannot be deleted here
    pub orphaned: usize,
    /// In-flight bound both phases ran with
    pub concurrency: usize,
}

impl RoundTripSummary {
    pub fn failure_count(&self) -> usize {
        self.created.failure_count + self.deleted.failure_count
    }

    pub fn elapsed(&self) -> Duration {
        self.created.elapsed + self.deleted.elapsed
    }
}

/// Creates `options.count` records and deletes the ones that were created.
///
/// `WhoAmI` is called first to confirm the connection and pick up the
/// service's parallelism hint. The delete phase only starts after every
/// create has a result.
#[tracing::instrument(skip(executor, web_api, cancel))]
pub async fn round_trip(
    executor: &BulkExecutor,
    web_api: &WebApiClient,
    options: &RoundTripOptions,
    cancel: CancellationToken,
) -> Result<RoundTripSummary> {
    // A run cancelled up front goes straight to the batches, which report
    // every operation as cancelled without touching the network.
    if !cancel.is_cancelled() {
        let who = web_api
            .who_am_i(&cancel)
            .await
            .context("Identity check failed")?;
        info!("Connected as user {}", who.user_id);
    }

    let concurrency = match (
        options.max_concurrency,
        web_api.recommended_degree_of_parallelism(),
    ) {
        (Some(requested), _) => requested,
        (None, Some(hint)) => {
            info!("Using the service's recommended parallelism of {}", hint);
            hint
        }
        (None, None) => DEFAULT_CONCURRENCY,
    };

    let creates: Vec<Operation> = (0..options.count)
        .map(|i| Operation::create(&options.collection, options.record(i)))
        .collect();

    let created = executor
        .run_batch(creates, concurrency, cancel.clone())
        .await
        .context("Create phase could not start")?;
    info!(
        "Created {}/{} {} in {:?}",
        created.success_count, options.count, options.collection, created.elapsed
    );

    let ids = created.created_ids();
    let orphaned = created.success_count - ids.len();
    if orphaned > 0 {
        warn!(
            "{} created {} returned no entity id and will not be deleted",
            orphaned, options.collection
        );
    }

    let deletes: Vec<Operation> = ids
        .into_iter()
        .map(|id| Operation::delete(&options.collection, id))
        .collect();

    let deleted = executor
        .run_batch(deletes, concurrency, cancel)
        .await
        .context("Delete phase could not start")?;
    info!(
        "Deleted {} {} in {:?}",
        deleted.success_count, options.collection, deleted.elapsed
    );

    Ok(RoundTripSummary {
        created,
        deleted,
        orphaned,
        concurrency,
    })
}
