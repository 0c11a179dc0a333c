//! Built-in anomaly detectors.
//!
//! Each detector is a stateless predicate over the detection context;
//! thresholds come from configuration so deployments can tune them
//! without code changes.

use relay_core::config::AnomalyThresholds;
use relay_core::types::{NewAnomaly, Severity};

use super::{AnomalyDetector, AnomalyEvent, DetectionContext};

/// Every built-in detector, boxed for registration.
pub fn builtins() -> Vec<Box<dyn AnomalyDetector>> {
    vec![
        Box::new(FlashMessage),
        Box::new(ZombieMessage),
        Box::new(NearDlq),
        Box::new(DlqMovement),
        Box::new(LongProcessing),
        Box::new(LockStolen),
        Box::new(BurstDequeue),
        Box::new(BulkOperation),
        Box::new(LargePayload),
        Box::new(QueueCleared),
    ]
}

/// A message claimed suspiciously fast after enqueue; usually a sign of
/// misconfigured scheduling or producer/consumer timing problems.
pub struct FlashMessage;

impl AnomalyDetector for FlashMessage {
    fn name(&self) -> &'static str {
        "flash_message"
    }
    fn description(&self) -> &'static str {
        "message claimed almost immediately after enqueue"
    }
    fn events(&self) -> &'static [AnomalyEvent] {
        &[AnomalyEvent::Dequeue]
    }
    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        thresholds: &AnomalyThresholds,
    ) -> Option<NewAnomaly> {
        let wait = ctx.time_in_queue_ms?;
        if wait >= thresholds.flash_message_threshold_ms {
            return None;
        }
        let mut anomaly = NewAnomaly::new("flash_message", Severity::Info);
        anomaly.details = serde_json::json!({
            "time_in_queue_ms": wait,
            "threshold_ms": thresholds.flash_message_threshold_ms,
        });
        Some(anomaly)
    }
}

/// A processing row so far past its deadline that the consumer is
/// presumed dead.
pub struct ZombieMessage;

impl AnomalyDetector for ZombieMessage {
    fn name(&self) -> &'static str {
        "zombie_message"
    }
    fn description(&self) -> &'static str {
        "lock overdue far beyond the expected timeout"
    }
    fn events(&self) -> &'static [AnomalyEvent] {
        &[AnomalyEvent::Reap]
    }
    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        thresholds: &AnomalyThresholds,
    ) -> Option<NewAnomaly> {
        let overdue = ctx.overdue_ms? as f64;
        let expected = ctx.expected_timeout_ms? as f64;
        if overdue <= expected * thresholds.zombie_multiplier {
            return None;
        }
        let mut anomaly = NewAnomaly::new("zombie_message", Severity::Critical);
        anomaly.details = serde_json::json!({
            "overdue_ms": ctx.overdue_ms,
            "expected_timeout_ms": ctx.expected_timeout_ms,
            "zombie_multiplier": thresholds.zombie_multiplier,
        });
        Some(anomaly)
    }
}

/// A message one nack away (or configurably close) from the DLQ.
pub struct NearDlq;

impl AnomalyDetector for NearDlq {
    fn name(&self) -> &'static str {
        "near_dlq"
    }
    fn description(&self) -> &'static str {
        "message is close to exhausting its attempts"
    }
    fn events(&self) -> &'static [AnomalyEvent] {
        &[AnomalyEvent::Nack, AnomalyEvent::Dequeue]
    }
    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        thresholds: &AnomalyThresholds,
    ) -> Option<NewAnomaly> {
        if ctx.moved_to_dlq {
            return None;
        }
        let remaining = ctx.attempts_remaining?;
        if remaining < 0 || remaining > thresholds.near_dlq_threshold {
            return None;
        }
        let mut anomaly = NewAnomaly::new("near_dlq", Severity::Warning);
        anomaly.details = serde_json::json!({ "attempts_remaining": remaining });
        Some(anomaly)
    }
}

/// A message crossed into the DLQ via nack.
pub struct DlqMovement;

impl AnomalyDetector for DlqMovement {
    fn name(&self) -> &'static str {
        "dlq_movement"
    }
    fn description(&self) -> &'static str {
        "message moved to the dead-letter partition"
    }
    fn events(&self) -> &'static [AnomalyEvent] {
        &[AnomalyEvent::Nack]
    }
    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        _thresholds: &AnomalyThresholds,
    ) -> Option<NewAnomaly> {
        if !ctx.moved_to_dlq {
            return None;
        }
        Some(NewAnomaly::new("dlq_movement", Severity::Warning))
    }
}

/// Processing time well beyond what the visibility timeout suggests.
pub struct LongProcessing;

impl AnomalyDetector for LongProcessing {
    fn name(&self) -> &'static str {
        "long_processing"
    }
    fn description(&self) -> &'static str {
        "acknowledged after unusually long processing"
    }
    fn events(&self) -> &'static [AnomalyEvent] {
        &[AnomalyEvent::Ack]
    }
    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        thresholds: &AnomalyThresholds,
    ) -> Option<NewAnomaly> {
        let elapsed = ctx.processing_time_ms? as f64;
        let ack_timeout = ctx.ack_timeout_seconds? as f64;
        let limit = thresholds.long_processing_multiplier * ack_timeout * 500.0;
        if elapsed <= limit {
            return None;
        }
        let mut anomaly = NewAnomaly::new("long_processing", Severity::Warning);
        anomaly.details = serde_json::json!({
            "processing_time_ms": ctx.processing_time_ms,
            "limit_ms": limit as i64,
        });
        Some(anomaly)
    }
}

/// Fencing token mismatch on ack or nack: the presenter lost its lock,
/// another consumer now owns the row.
pub struct LockStolen;

impl AnomalyDetector for LockStolen {
    fn name(&self) -> &'static str {
        "lock_stolen"
    }
    fn description(&self) -> &'static str {
        "follow-up presented a stale fencing token"
    }
    fn events(&self) -> &'static [AnomalyEvent] {
        &[AnomalyEvent::Ack, AnomalyEvent::Nack]
    }
    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        _thresholds: &AnomalyThresholds,
    ) -> Option<NewAnomaly> {
        let presented = ctx.presented_token?;
        if ctx.current_token == Some(presented) {
            return None;
        }
        let mut anomaly = NewAnomaly::new("lock_stolen", Severity::Critical);
        anomaly.details = serde_json::json!({
            "presented_token": presented,
            "current_token": ctx.current_token,
        });
        Some(anomaly)
    }
}

/// One consumer claiming messages much faster than its peers.
pub struct BurstDequeue;

impl AnomalyDetector for BurstDequeue {
    fn name(&self) -> &'static str {
        "burst_dequeue"
    }
    fn description(&self) -> &'static str {
        "consumer claimed many messages inside the burst window"
    }
    fn events(&self) -> &'static [AnomalyEvent] {
        &[AnomalyEvent::Dequeue]
    }
    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        thresholds: &AnomalyThresholds,
    ) -> Option<NewAnomaly> {
        let count = ctx.recent_dequeues_in_window?;
        if count < thresholds.burst_threshold_count {
            return None;
        }
        let mut anomaly = NewAnomaly::new("burst_dequeue", Severity::Warning);
        anomaly.details = serde_json::json!({
            "dequeues_in_window": count,
            "window_seconds": thresholds.burst_threshold_seconds,
        });
        Some(anomaly)
    }
}

/// A bulk operation touched more rows than the configured threshold.
/// Produces `bulk_delete` / `bulk_move` / `bulk_enqueue` / … tags from
/// the operation name.
pub struct BulkOperation;

impl AnomalyDetector for BulkOperation {
    fn name(&self) -> &'static str {
        "bulk_operation"
    }
    fn description(&self) -> &'static str {
        "bulk operation affected an unusually large row count"
    }
    fn events(&self) -> &'static [AnomalyEvent] {
        &[AnomalyEvent::BulkOp]
    }
    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        thresholds: &AnomalyThresholds,
    ) -> Option<NewAnomaly> {
        let affected = ctx.affected_count?;
        if affected <= thresholds.bulk_operation_threshold {
            return None;
        }
        let op = ctx.operation.unwrap_or("op");
        let severity = if op == "enqueue" {
            Severity::Info
        } else {
            Severity::Warning
        };
        let mut anomaly = NewAnomaly::new(format!("bulk_{op}"), severity);
        anomaly.details = serde_json::json!({
            "affected_count": affected,
            "threshold": thresholds.bulk_operation_threshold,
        });
        Some(anomaly)
    }
}

/// Payload larger than the configured warning size.
pub struct LargePayload;

impl AnomalyDetector for LargePayload {
    fn name(&self) -> &'static str {
        "large_payload"
    }
    fn description(&self) -> &'static str {
        "enqueued payload exceeds the size threshold"
    }
    fn events(&self) -> &'static [AnomalyEvent] {
        &[AnomalyEvent::Enqueue]
    }
    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        thresholds: &AnomalyThresholds,
    ) -> Option<NewAnomaly> {
        let size = ctx.payload_size?;
        if size <= thresholds.large_payload_bytes {
            return None;
        }
        let mut anomaly = NewAnomaly::new("large_payload", Severity::Warning);
        anomaly.details = serde_json::json!({
            "payload_size": size,
            "threshold_bytes": thresholds.large_payload_bytes,
        });
        Some(anomaly)
    }
}

/// A queue was cleared. Always critical; clearing is destructive.
pub struct QueueCleared;

impl AnomalyDetector for QueueCleared {
    fn name(&self) -> &'static str {
        "queue_cleared"
    }
    fn description(&self) -> &'static str {
        "all messages in a queue were removed"
    }
    fn events(&self) -> &'static [AnomalyEvent] {
        &[AnomalyEvent::Clear]
    }
    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        _thresholds: &AnomalyThresholds,
    ) -> Option<NewAnomaly> {
        let mut anomaly = NewAnomaly::new("queue_cleared", Severity::Critical);
        anomaly.details = serde_json::json!({ "removed": ctx.affected_count });
        Some(anomaly)
    }
}
