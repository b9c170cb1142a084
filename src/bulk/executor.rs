use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{BatchReport, ErrorKind, Operation, OperationKind, OperationResult, Outcome};
use crate::auth::AuthError;
use crate::http::{Transport, TransportError};
use crate::webapi::entity_id_from_headers;

type Queue = Arc<Mutex<VecDeque<Operation>>>;

/// Runs batches of operations through a shared [`Transport`] with a bounded
/// number of concurrent workers.
#[derive(Clone)]
pub struct BulkExecutor {
    transport: Arc<dyn Transport>,
    base_url: Arc<str>,
}

impl BulkExecutor {
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            transport,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Executes every operation and reports each one exactly once.
    ///
    /// Only a failure to obtain the initial token aborts the batch. Any other
    /// failure is recorded against its own operation. Once `cancel` fires,
    /// operations not yet started and those still in flight are reported as
    /// [`ErrorKind::Cancelled`]; results recorded before that are kept.
    #[tracing::instrument(skip(self, operations, cancel), fields(count = operations.len()))]
    pub async fn run_batch(
        &self,
        operations: Vec<Operation>,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<BatchReport, AuthError> {
        let started = Instant::now();
        let mut report = BatchReport::default();

        if operations.is_empty() {
            return Ok(report);
        }

        if cancel.is_cancelled() {
            for operation in operations {
                report.record(OperationResult::cancelled(operation));
            }
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        self.transport.authenticate().await?;

        let workers = max_concurrency.max(1).min(operations.len());
        debug!(
            "Running {} operations on {} workers",
            operations.len(),
            workers
        );

        let queue: Queue = Arc::new(Mutex::new(operations.into_iter().collect()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for _ in 0..workers {
            let worker = Worker {
                transport: Arc::clone(&self.transport),
                base_url: Arc::clone(&self.base_url),
                queue: Arc::clone(&queue),
                cancel: cancel.clone(),
                results: tx.clone(),
            };
            tasks.spawn(worker.run());
        }
        drop(tx);

        while let Some(result) = rx.recv().await {
            report.record(result);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!("Bulk worker terminated abnormally: {}", err);
            }
        }

        let leftover: Vec<Operation> = lock(&queue).drain(..).collect();
        if !leftover.is_empty() {
            warn!("{} operations were not started", leftover.len());
        }
        for operation in leftover {
            report.record(OperationResult::cancelled(operation));
        }

        report.elapsed = started.elapsed();
        debug!(
            "Batch finished in {:?}: {} succeeded, {} failed",
            report.elapsed, report.success_count, report.failure_count
        );
        Ok(report)
    }
}

fn lock(queue: &Queue) -> std::sync::MutexGuard<'_, VecDeque<Operation>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Worker {
    transport: Arc<dyn Transport>,
    base_url: Arc<str>,
    queue: Queue,
    cancel: CancellationToken,
    results: mpsc::UnboundedSender<OperationResult>,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(operation) = lock(&self.queue).pop_front() else {
                break;
            };
            let claim = Claim::new(operation, self.results.clone());
            let result = execute(
                self.transport.as_ref(),
                &self.base_url,
                claim.operation(),
                &self.cancel,
            )
            .await;
            if !claim.report(result) {
                break;
            }
        }
    }
}

/// An operation taken off the queue. If it is dropped without a result, for
/// instance because the worker panicked, it is reported as cancelled instead
/// of vanishing from the batch. It is never re-queued, since a create may
/// already have reached the server.
struct Claim {
    operation: Operation,
    results: mpsc::UnboundedSender<OperationResult>,
    reported: bool,
}

impl Claim {
    fn new(operation: Operation, results: mpsc::UnboundedSender<OperationResult>) -> Self {
        Self {
            operation,
            results,
            reported: false,
        }
    }

    fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Hands the result to the collector. `false` once the collector is gone.
    fn report(mut self, result: OperationResult) -> bool {
        self.reported = true;
        self.results.send(result).is_ok()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        error!("{}: worker stopped before reporting a result", self.operation);
        let _ = self.results.send(OperationResult {
            operation: self.operation.clone(),
            outcome: Outcome::Failure {
                kind: ErrorKind::Cancelled,
                message: "worker stopped before reporting a result".to_string(),
            },
            attempts: 0,
            elapsed: Duration::ZERO,
        });
    }
}

async fn execute(
    transport: &dyn Transport,
    base_url: &str,
    operation: &Operation,
    cancel: &CancellationToken,
) -> OperationResult {
    let started = Instant::now();
    let request = operation.to_request(base_url);

    let (outcome, attempts) = match transport.send(request, cancel).await {
        Ok(response) if cancel.is_cancelled() => {
            let id = match operation.kind {
                OperationKind::Create { .. } => entity_id_from_headers(&response.headers),
                OperationKind::Delete { .. } => None,
            };
            let message = match id {
                Some(id) => format!(
                    "cancelled while in flight; server answered HTTP {} and created {}({})",
                    response.status.as_u16(),
                    operation.collection,
                    id
                ),
                None => format!(
                    "cancelled while in flight; server answered HTTP {}",
                    response.status.as_u16()
                ),
            };
            warn!("{}: {}", operation, message);
            (
                Outcome::Failure {
                    kind: ErrorKind::Cancelled,
                    message,
                },
                response.attempts,
            )
        }
        Ok(response) if response.is_success() => {
            let id = match operation.kind {
                OperationKind::Create { .. } => entity_id_from_headers(&response.headers),
                OperationKind::Delete { .. } => None,
            };
            if id.is_none() && matches!(operation.kind, OperationKind::Create { .. }) {
                debug!("{}: response carried no entity id", operation);
            }
            (Outcome::Success(id), response.attempts)
        }
        Ok(response) => {
            let status = response.status.as_u16();
            error!(
                "{} failed with HTTP {} after {} attempts: {}",
                operation, status, response.attempts, response.body
            );
            let message = if response.body.is_empty() {
                response
                    .status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                response.body
            };
            (
                Outcome::Failure {
                    kind: ErrorKind::TerminalHttp { status },
                    message,
                },
                response.attempts,
            )
        }
        Err(err) => {
            let kind = match &err {
                TransportError::Auth(_) => ErrorKind::Auth,
                TransportError::Exhausted { status, .. } => ErrorKind::Transport {
                    status: status.map(|s| s.as_u16()),
                },
                TransportError::Cancelled { .. } => ErrorKind::Cancelled,
            };
            if kind == ErrorKind::Cancelled {
                warn!("{}: {}", operation, err);
            } else {
                error!("{} failed ({}): {}", operation, kind, err);
            }
            (
                Outcome::Failure {
                    kind,
                    message: err.to_string(),
                },
                err.attempts(),
            )
        }
    };

    OperationResult {
        operation: operation.clone(),
        outcome,
        attempts,
        elapsed: started.elapsed(),
    }
}
