//! Per-operation tracking across a retry sequence
//!
//! An [`OperationContext`] is opened when an operation starts and finalized
//! exactly once, either through [`OperationContext::exit`] or, if the owner
//! goes away first, by its `Drop` impl with an [`Outcome::Abandoned`] record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ContextMap, ErrorRecord};
use crate::telemetry::{OperationRecord, Outcome, RecordSink};

/// Tracks attempts, timing and classified failures for one operation
pub struct OperationContext {
    id: Uuid,
    operation: String,
    resource: String,
    parameters: ContextMap,
    attempt_number: u32,
    started: Instant,
    started_at: DateTime<Utc>,
    history: Vec<ErrorRecord>,
    sink: Arc<dyn RecordSink>,
    finalized: bool,
}

impl OperationContext {
    /// Open a context; the first attempt is attempt 1
    pub fn enter(
        operation: impl Into<String>,
        resource: impl Into<String>,
        parameters: ContextMap,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let context = Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            resource: resource.into(),
            parameters,
            attempt_number: 1,
            started: Instant::now(),
            started_at: Utc::now(),
            history: Vec::new(),
            sink,
            finalized: false,
        };
        debug!(
            operation_id = %context.id,
            resource = %context.resource,
            "🚀 Entering {}", context.operation
        );
        context
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Number of the attempt about to run (or running)
    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    pub fn history(&self) -> &[ErrorRecord] {
        &self.history
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Call parameters with credential-bearing entries masked
    pub fn masked_parameters(&self) -> ContextMap {
        self.parameters.masked()
    }

    /// Append a failed attempt to the history and advance the attempt counter
    ///
    /// The stored record is stamped with the operation, resource, attempt
    /// number and wall-clock time of the failure, and has credentials masked.
    pub fn record_attempt(&mut self, mut record: ErrorRecord) -> &ErrorRecord {
        record.insert_context("operation", self.operation.as_str());
        record.insert_context("resource", self.resource.as_str());
        record.insert_context("attempt", self.attempt_number);
        record.insert_context(
            "timestamp",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        self.history.push(record.masked());
        self.attempt_number += 1;
        &self.history[self.history.len() - 1]
    }

    /// Finalize with `outcome` and emit the record to the sink
    pub fn exit(mut self, outcome: Outcome) -> OperationRecord {
        self.finalize(outcome)
    }

    fn finalize(&mut self, outcome: Outcome) -> OperationRecord {
        self.finalized = true;
        let attempts = match outcome {
            Outcome::Success => self.attempt_number,
            _ => self.history.len() as u32,
        };
        let record = OperationRecord {
            id: self.id,
            timestamp: Utc::now(),
            started_at: self.started_at,
            operation: self.operation.clone(),
            resource: self.resource.clone(),
            outcome: mask_outcome(outcome),
            duration_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            attempts,
            history: self.history.iter().map(ErrorRecord::masked).collect(),
            parameters: self.parameters.masked(),
        };
        self.sink.emit(&record);
        record
    }

    /// Parameters as a JSON object for attaching to a terminal error
    pub(crate) fn parameters_json(&self) -> Value {
        serde_json::to_value(self.parameters.masked()).unwrap_or(Value::Null)
    }
}

fn mask_outcome(outcome: Outcome) -> Outcome {
    match outcome {
        Outcome::Failure { error } => Outcome::Failure {
            error: error.masked(),
        },
        other => other,
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(
                operation_id = %self.id,
                "⚠️ {} dropped before completion", self.operation
            );
            self.finalize(Outcome::Abandoned);
        }
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("resource", &self.resource)
            .field("attempt_number", &self.attempt_number)
            .field("history", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::telemetry::MemorySink;

    fn params() -> ContextMap {
        [("series_id", Value::from("GDP")), ("api_key", Value::from("abcdef0123456789"))]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_attempts_are_stamped_in_order() {
        let sink = Arc::new(MemorySink::new());
        let mut context = OperationContext::enter("get_series", "fred", params(), sink.clone());
        assert_eq!(context.attempt_number(), 1);

        context.record_attempt(ErrorRecord::connection("refused"));
        let second = context.record_attempt(ErrorRecord::connection("reset"));
        assert_eq!(second.context().get("attempt"), Some(&Value::from(2)));
        assert_eq!(second.context().get("operation"), Some(&Value::from("get_series")));
        assert!(second.context().contains_key("timestamp"));
        assert_eq!(context.attempt_number(), 3);
        assert_eq!(context.history().len(), 2);

        let record = context.exit(Outcome::Success);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.history.len(), 2);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_parameters_are_masked_in_record() {
        let sink = Arc::new(MemorySink::new());
        let context = OperationContext::enter("get_series", "fred", params(), sink.clone());
        let record = context.exit(Outcome::Success);
        assert_eq!(record.parameters.get("api_key"), Some(&Value::from("abcde***")));
        assert_eq!(record.parameters.get("series_id"), Some(&Value::from("GDP")));
        assert!(!record.to_json().to_string().contains("abcdef0123456789"));
    }

    #[test]
    fn test_nested_parameters_are_masked_in_record() {
        let sink = Arc::new(MemorySink::new());
        let parameters: ContextMap = [
            ("series_id", Value::from("GDP")),
            (
                "auth",
                serde_json::json!({ "api_key": "abcdef0123456789abcdef0123456789" }),
            ),
        ]
        .into_iter()
        .collect();
        let context = OperationContext::enter("get_series", "fred", parameters, sink.clone());

        let record = context.exit(Outcome::Success);
        assert_eq!(
            record.parameters.get("auth"),
            Some(&serde_json::json!({ "api_key": "abcde***" }))
        );
        assert!(!record.to_json().to_string().contains("abcdef0123456789abcdef0123456789"));
    }

    #[test]
    fn test_recorded_attempts_are_scrubbed() {
        let sink = Arc::new(MemorySink::new());
        let mut context = OperationContext::enter("get_series", "fred", ContextMap::new(), sink);
        let stored = context.record_attempt(ErrorRecord::connection(
            "GET https://api.stlouisfed.org/fred/series?api_key=abcdef0123456789abcdef0123456789 timed out",
        ));
        assert!(stored.message().contains("api_key=abcde***"));
        assert!(!context.history()[0].message().contains("abcdef0123456789abcdef0123456789"));
        context.exit(Outcome::Cancelled);
    }

    #[test]
    fn test_drop_without_exit_emits_abandoned() {
        let sink = Arc::new(MemorySink::new());
        {
            let mut context =
                OperationContext::enter("get_series", "haver", ContextMap::new(), sink.clone());
            context.record_attempt(ErrorRecord::rate_limit("slow down", None));
        }
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Abandoned);
        assert_eq!(records[0].attempts, 1);
        assert_eq!(records[0].history[0].kind(), ErrorKind::RateLimit);
    }

    #[test]
    fn test_exit_emits_exactly_once() {
        let sink = Arc::new(MemorySink::new());
        let context = OperationContext::enter("get_series", "fred", ContextMap::new(), sink.clone());
        context.exit(Outcome::Cancelled);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.last().map(|r| r.outcome), Some(Outcome::Cancelled));
    }
}
