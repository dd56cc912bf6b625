//! Operation history recording.
//!
//! Every successful mutation produces one record handed to a pluggable
//! sink; the default sink writes a structured log line so deployments
//! without a durable audit backend still keep a trail.

use chrono::{DateTime, Utc};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Create,
    Delete,
    Update,
    UpdateIsolate,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Delete => "delete",
            OperationType::Update => "update",
            OperationType::UpdateIsolate => "update_isolate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordEntry {
    pub resource_type: &'static str,
    pub resource_name: String,
    pub namespace: String,
    pub operation_type: OperationType,
    pub operator: String,
    pub detail: String,
    pub happen_time: DateTime<Utc>,
}

pub trait HistorySink: Send + Sync {
    fn record(&self, entry: RecordEntry);
}

/// Default sink: structured log line per record.
#[derive(Debug, Default)]
pub struct LogHistorySink;

impl HistorySink for LogHistorySink {
    fn record(&self, entry: RecordEntry) {
        info!(
            target: "history",
            resource_type = entry.resource_type,
            resource = %entry.resource_name,
            namespace = %entry.namespace,
            operation = entry.operation_type.as_str(),
            operator = %entry.operator,
            detail = %entry.detail,
            "operation recorded"
        );
    }
}
