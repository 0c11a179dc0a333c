//! Data model shared across the broker: messages, queues, claims, activity
//! log entries, anomaly records, and consumer stats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Message lifecycle ─────────────────────────────────────────

/// Lifecycle status of a message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Processing,
    Acknowledged,
    Dead,
    Archived,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Acknowledged => "acknowledged",
            Self::Dead => "dead",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "acknowledged" => Some(Self::Acknowledged),
            "dead" => Some(Self::Dead),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Terminal statuses are never returned to queued/processing by the
    /// engine; only administrative moves may leave them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Dead | Self::Archived)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub queue_name: String,
    pub message_type: Option<String>,
    pub payload: Value,
    pub priority: i32,
    /// Priority at enqueue time; restored on every requeue so retries
    /// never drift a message down the priority ladder.
    pub original_priority: Option<i32>,
    pub status: MessageStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub ack_timeout_seconds: i32,
    pub lock_token: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub consumer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dequeued_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub payload_size: i64,
}

/// Producer-side input for a single enqueue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMessage {
    /// Caller-assigned id; generated when absent.
    pub id: Option<String>,
    pub message_type: Option<String>,
    pub payload: Value,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    pub ack_timeout_seconds: Option<i32>,
}

impl NewMessage {
    pub fn with_payload(payload: Value) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }
}

/// An exclusive claim handed to a consumer by the dequeue core.
///
/// The `lock_token` is the fencing token the consumer must present on any
/// follow-up ack, nack, or touch.
#[derive(Debug, Clone, Serialize)]
pub struct Claim {
    pub message: Message,
    pub lock_token: String,
    pub attempt_count: i32,
    pub processing_started_at: DateTime<Utc>,
}

// ── Queues ────────────────────────────────────────────────────

/// Backing-table flavor of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    Standard,
    /// Lower durability, higher throughput (`UNLOGGED` table).
    Unlogged,
    /// Time-sliced retention; rows live on the standard table.
    Partitioned,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Unlogged => "unlogged",
            Self::Partitioned => "partitioned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Self::Standard),
            "unlogged" => Some(Self::Unlogged),
            "partitioned" => Some(Self::Partitioned),
            _ => None,
        }
    }

    /// Name of the table holding this queue's rows.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Unlogged => "messages_unlogged",
            _ => "messages",
        }
    }
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full queue definition, including lazily refreshed denormalized counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub name: String,
    pub queue_type: QueueType,
    pub ack_timeout_seconds: i32,
    pub max_attempts: i32,
    pub partition_interval: Option<String>,
    pub retention_interval: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_count: Option<i64>,
}

/// The three fields the enqueue/dequeue hot path needs. This is the only
/// queue data that is ever cached; full definitions carry mutable counts
/// and are always read fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub queue_type: QueueType,
    pub max_attempts: i32,
    pub ack_timeout_seconds: i32,
}

// ── Activity log ──────────────────────────────────────────────

/// Append-only lifecycle event, as read back from storage.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub action: String,
    pub message_id: Option<String>,
    pub message_type: Option<String>,
    pub consumer_id: Option<String>,
    pub queue_name: Option<String>,
    pub payload_size: Option<i64>,
    pub processing_time_ms: Option<i64>,
    pub attempt_count: Option<i32>,
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

/// A lifecycle event waiting in the recorder buffer.
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub action: String,
    pub message_id: Option<String>,
    pub message_type: Option<String>,
    pub consumer_id: Option<String>,
    pub queue_name: Option<String>,
    pub payload_size: Option<i64>,
    pub processing_time_ms: Option<i64>,
    pub attempt_count: Option<i32>,
    pub context: Value,
}

impl NewActivity {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            message_id: None,
            message_type: None,
            consumer_id: None,
            queue_name: None,
            payload_size: None,
            processing_time_ms: None,
            attempt_count: None,
            context: Value::Null,
        }
    }

    /// Populate message-derived fields from a row.
    pub fn for_message(action: impl Into<String>, message: &Message) -> Self {
        Self {
            action: action.into(),
            message_id: Some(message.id.clone()),
            message_type: message.message_type.clone(),
            consumer_id: message.consumer_id.clone(),
            queue_name: Some(message.queue_name.clone()),
            payload_size: Some(message.payload_size),
            processing_time_ms: None,
            attempt_count: Some(message.attempt_count),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_processing_time(mut self, ms: i64) -> Self {
        self.processing_time_ms = Some(ms);
        self
    }
}

// ── Anomalies ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted anomaly, as read back from storage.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyRecord {
    pub id: i64,
    pub anomaly_type: String,
    pub severity: Severity,
    pub message_id: Option<String>,
    pub consumer_id: Option<String>,
    pub queue_name: Option<String>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// An anomaly produced by a detector, pending batch persistence.
#[derive(Debug, Clone)]
pub struct NewAnomaly {
    pub anomaly_type: String,
    pub severity: Severity,
    pub message_id: Option<String>,
    pub consumer_id: Option<String>,
    pub queue_name: Option<String>,
    pub details: Value,
}

impl NewAnomaly {
    pub fn new(anomaly_type: impl Into<String>, severity: Severity) -> Self {
        Self {
            anomaly_type: anomaly_type.into(),
            severity,
            message_id: None,
            consumer_id: None,
            queue_name: None,
            details: Value::Null,
        }
    }
}

// ── Consumer stats ────────────────────────────────────────────

/// Per-consumer counters plus a bounded window of recent dequeue
/// timestamps used for burst detection.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStats {
    pub consumer_id: String,
    pub dequeued: i64,
    pub acknowledged: i64,
    pub failed: i64,
    pub last_dequeue_at: Option<DateTime<Utc>>,
    pub last_ack_at: Option<DateTime<Utc>>,
    pub recent_dequeues: Vec<DateTime<Utc>>,
}
