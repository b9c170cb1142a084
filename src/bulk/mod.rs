//! Bulk create/delete operations and their aggregated outcome.

mod executor;

use std::fmt;
use std::time::Duration;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::http::HttpRequest;
use crate::webapi::{collection_url, entity_url};

pub use executor::BulkExecutor;

/// Opaque record body. Field contents are never inspected.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    Create { payload: Record },
    Delete { target_id: Uuid },
}

/// One create or delete against an entity collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub collection: String,
    pub kind: OperationKind,
}

impl Operation {
    pub fn create(collection: impl Into<String>, payload: Record) -> Self {
        Self {
            collection: collection.into(),
            kind: OperationKind::Create { payload },
        }
    }

    pub fn delete(collection: impl Into<String>, target_id: Uuid) -> Self {
        Self {
            collection: collection.into(),
            kind: OperationKind::Delete { target_id },
        }
    }

    /// The HTTP request carrying out this operation.
    pub fn to_request(&self, base_url: &str) -> HttpRequest {
        match &self.kind {
            OperationKind::Create { payload } => HttpRequest::post(
                collection_url(base_url, &self.collection),
                Value::Object(payload.clone()),
            ),
            OperationKind::Delete { target_id } => {
                HttpRequest::delete(entity_url(base_url, &self.collection, target_id))
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OperationKind::Create { .. } => write!(f, "create {}", self.collection),
            OperationKind::Delete { target_id } => {
                write!(f, "delete {}({})", self.collection, target_id)
            }
        }
    }
}

/// Why an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No usable token.
    Auth,
    /// Transient failures outlasted the retry budget.
    Transport { status: Option<u16> },
    /// Non-success status that retrying would not change.
    TerminalHttp { status: u16 },
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::Transport { status: Some(s) } => write!(f, "transport (HTTP {})", s),
            ErrorKind::Transport { status: None } => write!(f, "transport"),
            ErrorKind::TerminalHttp { status } => write!(f, "HTTP {}", status),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Carries the created entity's id when the server returned a parseable one.
    Success(Option<Uuid>),
    Failure { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub operation: Operation,
    pub outcome: Outcome,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            Outcome::Failure { kind, .. } => Some(*kind),
            Outcome::Success(_) => None,
        }
    }

    pub(crate) fn cancelled(operation: Operation) -> Self {
        Self {
            operation,
            outcome: Outcome::Failure {
                kind: ErrorKind::Cancelled,
                message: "not started before cancellation".to_string(),
            },
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub success_count: usize,
    pub failure_count: usize,
    pub succeeded: Vec<OperationResult>,
    pub failures: Vec<OperationResult>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub(crate) fn record(&mut self, result: OperationResult) {
        if result.is_success() {
            self.success_count += 1;
            self.succeeded.push(result);
        } else {
            self.failure_count += 1;
            self.failures.push(result);
        }
    }

    pub fn total(&self) -> usize {
        self.success_count + self.failure_count
    }

    /// Ids returned by successful creates.
    pub fn created_ids(&self) -> Vec<Uuid> {
        self.succeeded
            .iter()
            .filter_map(|r| match (&r.operation.kind, &r.outcome) {
                (OperationKind::Create { .. }, Outcome::Success(id)) => *id,
                _ => None,
            })
            .collect()
    }

    /// Failures of the given kind, e.g. to count cancellations.
    pub fn failures_of(&self, kind: ErrorKind) -> usize {
        self.failures
            .iter()
            .filter(|r| r.error_kind() == Some(kind))
            .count()
    }
}
