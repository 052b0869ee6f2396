//! Structured operation records and the sinks that receive them
//!
//! Every retry sequence ends in exactly one [`OperationRecord`] handed to a
//! [`RecordSink`]. Records carry timing, the attempt history and the call's
//! parameters with credentials masked, so sinks never see raw secrets.
//!
//! - [`TracingSink`] forwards records as `tracing` events (the default)
//! - [`MemorySink`] keeps records in memory for inspection
//! - [`logging`] sets up the `tracing` subscriber itself

pub mod logging;

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ContextMap, ErrorRecord};

/// Target used for operation record events
pub const OPERATIONS_TARGET: &str = "fedetl::operations";

/// How an operation context was finalized
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure { error: ErrorRecord },
    Cancelled,
    /// Context dropped without an explicit exit, e.g. the caller dropped the future
    Abandoned,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure { .. } => "failure",
            Outcome::Cancelled => "cancelled",
            Outcome::Abandoned => "abandoned",
        }
    }
}

/// Finalized record of one retry sequence
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub operation: String,
    pub resource: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub attempts: u32,
    pub history: Vec<ErrorRecord>,
    pub parameters: ContextMap,
}

impl OperationRecord {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Receiver of finalized operation records
pub trait RecordSink: Send + Sync {
    fn emit(&self, record: &OperationRecord);
}

/// Emits records as structured `tracing` events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl RecordSink for TracingSink {
    fn emit(&self, record: &OperationRecord) {
        let payload = record.to_json().to_string();
        match &record.outcome {
            Outcome::Success => info!(
                target: OPERATIONS_TARGET,
                operation_id = %record.id,
                operation = %record.operation,
                resource = %record.resource,
                attempts = record.attempts,
                duration_ms = record.duration_ms,
                record = %payload,
                "✅ Completed {}", record.operation
            ),
            Outcome::Failure { error } => error!(
                target: OPERATIONS_TARGET,
                operation_id = %record.id,
                operation = %record.operation,
                resource = %record.resource,
                attempts = record.attempts,
                duration_ms = record.duration_ms,
                kind = %error.kind(),
                record = %payload,
                "❌ {} failed: {}", record.operation, error
            ),
            Outcome::Cancelled | Outcome::Abandoned => warn!(
                target: OPERATIONS_TARGET,
                operation_id = %record.id,
                operation = %record.operation,
                resource = %record.resource,
                attempts = record.attempts,
                duration_ms = record.duration_ms,
                outcome = record.outcome.label(),
                record = %payload,
                "⏹️ {} ended without a result", record.operation
            ),
        }
    }
}

/// Collects records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<OperationRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<OperationRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<OperationRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl RecordSink for MemorySink {
    fn emit(&self, record: &OperationRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureSignal;

    fn sample(outcome: Outcome) -> OperationRecord {
        let mut parameters = ContextMap::new();
        parameters.insert("series_id", "GDP");
        OperationRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            started_at: Utc::now(),
            operation: "get_series".to_string(),
            resource: "fred".to_string(),
            outcome,
            duration_ms: 12,
            attempts: 1,
            history: Vec::new(),
            parameters,
        }
    }

    #[test]
    fn test_record_json_shape() {
        let failure = Outcome::Failure {
            error: FailureSignal::http(503).to_record(),
        };
        let json = sample(failure).to_json();
        assert_eq!(json["operation"], "get_series");
        assert_eq!(json["outcome"]["status"], "failure");
        assert_eq!(json["outcome"]["error"]["kind"], "connection");
        assert_eq!(json["parameters"]["series_id"], "GDP");
    }

    #[test]
    fn test_memory_sink_collects_records() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.emit(&sample(Outcome::Success));
        sink.emit(&sample(Outcome::Cancelled));
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.last().map(|r| r.outcome), Some(Outcome::Cancelled));
    }

    #[test]
    fn test_tracing_sink_accepts_every_outcome() {
        let sink = TracingSink;
        sink.emit(&sample(Outcome::Success));
        sink.emit(&sample(Outcome::Abandoned));
        sink.emit(&sample(Outcome::Failure {
            error: ErrorRecord::validation("bad date"),
        }));
    }
}
