//! Per-failure diagnostics and the wire header names shared by every transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header names. Values are always strings.
pub mod headers {
    // Delayed enqueue.
    pub const SCHEDULED_AT: &str = "scheduled_at";
    pub const ORIGINAL_TASK: &str = "original_task";
    pub const ENQUEUED_AT: &str = "enqueued_at";

    // Retry requeue.
    pub const RETRY_ATTEMPT: &str = "retry_attempt";
    pub const SCHEDULED_FOR: &str = "scheduled_for";
    pub const BACKOFF_MS: &str = "backoff_ms";
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const LAST_ERROR: &str = "last_error";
    pub const FIRST_SEEN_AT: &str = "first_seen_at";

    // Dead-letter record.
    pub const ERROR: &str = "error";
    pub const RETRY_COUNT: &str = "retry_count";
    pub const ORIGINAL_OFFSET: &str = "original_offset";
    pub const ORIGINAL_TOPIC: &str = "original_topic";
    pub const METADATA: &str = "metadata";
    pub const DLQ_TIMESTAMP: &str = "dlq_timestamp";
    /// Undecodable headers of a dead-lettered transport entry, verbatim.
    pub const RAW_HEADERS: &str = "raw_headers";

    // Promotion.
    pub const PROMOTED_AT: &str = "promoted_at";
}

/// Processing stages recorded on a failing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStep {
    Received,
    Parsed,
    Dispatched,
    Failed,
    Retried,
    DeadLettered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: ProcessingStep,
    pub at: DateTime<Utc>,
}

/// Diagnostics for one failing message, keyed by its transport position.
///
/// Lives only until the message is resolved (acknowledged, requeued or
/// dead-lettered); what must survive a restart travels in headers instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub retry_count: u32,
    pub original_topic: String,
    pub original_partition: u32,
    pub original_offset: String,
    pub first_seen: DateTime<Utc>,
    pub last_error: Option<String>,
    pub correlation_id: String,
    pub steps: Vec<StepRecord>,
}

impl TaskMetadata {
    pub fn new(
        topic: impl Into<String>,
        partition: u32,
        offset: impl Into<String>,
        correlation_id: impl Into<String>,
        first_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            retry_count: 0,
            original_topic: topic.into(),
            original_partition: partition,
            original_offset: offset.into(),
            first_seen,
            last_error: None,
            correlation_id: correlation_id.into(),
            steps: Vec::new(),
        }
    }

    pub fn record(&mut self, step: ProcessingStep, at: DateTime<Utc>) {
        self.steps.push(StepRecord { step, at });
    }

    pub fn record_failure(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.record(ProcessingStep::Failed, at);
    }

    /// JSON form carried in the `metadata` dead-letter header.
    pub fn to_header_value(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Generate a new correlation identifier (UUIDv7, time-ordered).
pub fn new_correlation_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
