//! Anomaly engine: pluggable detectors fired on lifecycle events.
//!
//! Detectors are pure predicates over a [`DetectionContext`]; the
//! registry keeps an event → detector index and isolates each detector so
//! one buggy implementation cannot poison the pipeline. Everything a
//! pass produces is persisted in a single batched insert, best-effort
//! with one internal retry on deadlock.

pub mod detectors;
pub mod stats;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use sqlx::{QueryBuilder, Row};
use tracing::{debug, warn};

use relay_core::config::AnomalyThresholds;
use relay_core::types::{AnomalyRecord, NewAnomaly, Severity};
use relay_storage::{Storage, StorageError};

use crate::error::EngineError;
use stats::ConsumerTracker;

// ── Events and context ────────────────────────────────────────

/// Lifecycle events detectors can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyEvent {
    Enqueue,
    Dequeue,
    Ack,
    Nack,
    /// Reaper pass over an overdue row.
    Reap,
    /// Bulk administrative operation (delete, move, enqueue, requeue).
    BulkOp,
    /// A queue was cleared.
    Clear,
}

impl AnomalyEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Dequeue => "dequeue",
            Self::Ack => "ack",
            Self::Nack => "nack",
            Self::Reap => "reap",
            Self::BulkOp => "bulk_op",
            Self::Clear => "clear",
        }
    }
}

/// Everything a detector may look at for one event. Fields irrelevant to
/// the event stay `None`.
#[derive(Debug, Clone)]
pub struct DetectionContext<'a> {
    pub event: AnomalyEvent,
    pub queue_name: Option<&'a str>,
    pub message_id: Option<&'a str>,
    pub message_type: Option<&'a str>,
    pub consumer_id: Option<&'a str>,
    pub payload_size: Option<i64>,
    pub time_in_queue_ms: Option<i64>,
    pub processing_time_ms: Option<i64>,
    pub ack_timeout_seconds: Option<i32>,
    pub attempts_remaining: Option<i32>,
    pub moved_to_dlq: bool,
    pub overdue_ms: Option<i64>,
    pub expected_timeout_ms: Option<i64>,
    pub presented_token: Option<&'a str>,
    pub current_token: Option<&'a str>,
    pub recent_dequeues_in_window: Option<usize>,
    pub operation: Option<&'a str>,
    pub affected_count: Option<u64>,
}

impl<'a> DetectionContext<'a> {
    pub fn new(event: AnomalyEvent) -> Self {
        Self {
            event,
            queue_name: None,
            message_id: None,
            message_type: None,
            consumer_id: None,
            payload_size: None,
            time_in_queue_ms: None,
            processing_time_ms: None,
            ack_timeout_seconds: None,
            attempts_remaining: None,
            moved_to_dlq: false,
            overdue_ms: None,
            expected_timeout_ms: None,
            presented_token: None,
            current_token: None,
            recent_dequeues_in_window: None,
            operation: None,
            affected_count: None,
        }
    }

    /// Stamp message identity fields onto a produced anomaly.
    fn tag(&self, mut anomaly: NewAnomaly) -> NewAnomaly {
        anomaly.message_id = anomaly
            .message_id
            .or_else(|| self.message_id.map(str::to_string));
        anomaly.consumer_id = anomaly
            .consumer_id
            .or_else(|| self.consumer_id.map(str::to_string));
        anomaly.queue_name = anomaly
            .queue_name
            .or_else(|| self.queue_name.map(str::to_string));
        anomaly
    }
}

// ── Detector registry ─────────────────────────────────────────

/// A pluggable anomaly detector.
pub trait AnomalyDetector: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// Events this detector wants to see.
    fn events(&self) -> &'static [AnomalyEvent];
    fn enabled_by_default(&self) -> bool {
        true
    }
    /// Inspect one event; `None` means nothing suspicious.
    fn detect(&self, ctx: &DetectionContext<'_>, thresholds: &AnomalyThresholds)
        -> Option<NewAnomaly>;
}

struct DetectorEntry {
    detector: Box<dyn AnomalyDetector>,
    enabled: bool,
}

/// Named detectors plus an event → detector-name inverted index.
#[derive(Default)]
pub struct DetectorRegistry {
    entries: HashMap<&'static str, DetectorEntry>,
    by_event: HashMap<AnomalyEvent, Vec<&'static str>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every built-in detector.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for detector in detectors::builtins() {
            registry.register(detector);
        }
        registry
    }

    pub fn register(&mut self, detector: Box<dyn AnomalyDetector>) {
        let name = detector.name();
        let enabled = detector.enabled_by_default();
        for event in detector.events() {
            let names = self.by_event.entry(*event).or_default();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        self.entries.insert(name, DetectorEntry { detector, enabled });
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        if self.entries.remove(name).is_none() {
            return false;
        }
        for names in self.by_event.values_mut() {
            names.retain(|n| *n != name);
        }
        true
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.entries.get(name).map(|e| e.enabled).unwrap_or(false)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run every enabled detector registered for the event. A panicking
    /// detector is logged and skipped.
    pub fn run(
        &self,
        ctx: &DetectionContext<'_>,
        thresholds: &AnomalyThresholds,
    ) -> Vec<NewAnomaly> {
        let Some(names) = self.by_event.get(&ctx.event) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for name in names {
            let Some(entry) = self.entries.get(name) else {
                continue;
            };
            if !entry.enabled {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| entry.detector.detect(ctx, thresholds))) {
                Ok(Some(anomaly)) => found.push(ctx.tag(anomaly)),
                Ok(None) => {}
                Err(_) => warn!(detector = name, event = ctx.event.as_str(), "detector panicked"),
            }
        }
        found
    }
}

// ── Engine ────────────────────────────────────────────────────

pub struct AnomalyEngine {
    storage: Arc<Storage>,
    thresholds: AnomalyThresholds,
    registry: RwLock<DetectorRegistry>,
    stats: ConsumerTracker,
}

impl AnomalyEngine {
    pub fn new(storage: Arc<Storage>, thresholds: AnomalyThresholds) -> Self {
        let stats = ConsumerTracker::new(storage.clone(), thresholds.burst_threshold_seconds);
        Self {
            storage,
            thresholds,
            registry: RwLock::new(DetectorRegistry::with_builtins()),
            stats,
        }
    }

    pub fn registry(&self) -> &RwLock<DetectorRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &ConsumerTracker {
        &self.stats
    }

    /// Run the enabled detectors for one event without persisting.
    /// Batch callers (the reaper) collect results across many contexts
    /// and persist them in one insert.
    pub fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<NewAnomaly> {
        let registry = self.registry.read().expect("detector registry lock");
        registry.run(ctx, &self.thresholds)
    }

    /// Run detectors for one event and persist whatever fires.
    /// Observational: never surfaces an error to the caller.
    pub async fn fire(&self, ctx: DetectionContext<'_>) {
        let mut found = self.detect(&ctx);
        // Burst anomalies dedup per consumer within the window.
        found.retain(|a| {
            a.anomaly_type != "burst_dequeue"
                || a.consumer_id
                    .as_deref()
                    .map(|c| self.stats.note_burst(c))
                    .unwrap_or(false)
        });
        self.persist(found).await;
    }

    /// Batched best-effort insert with a single retry on deadlock.
    pub async fn persist(&self, anomalies: Vec<NewAnomaly>) {
        if anomalies.is_empty() {
            return;
        }
        let count = anomalies.len();
        match insert_batch(&self.storage, &anomalies).await {
            Ok(()) => debug!(count, "anomalies persisted"),
            Err(e) if e.is_deadlock() => {
                if let Err(e) = insert_batch(&self.storage, &anomalies).await {
                    warn!(count, "anomaly insert failed after deadlock retry: {}", e);
                }
            }
            Err(e) => warn!(count, "anomaly insert failed, dropping batch: {}", e),
        }
    }

    /// Recent anomalies, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<AnomalyRecord>, EngineError> {
        let rows = sqlx::query(
            "SELECT id, anomaly_type, severity, message_id, consumer_id, queue_name, details, \
             created_at FROM anomalies ORDER BY id DESC LIMIT $1",
        )
        .bind(limit.clamp(1, 1000))
        .fetch_all(self.storage.read_pool())
        .await
        .map_err(StorageError::Query)?;
        rows.iter()
            .map(|row| -> Result<AnomalyRecord, EngineError> {
                let severity_raw: String = row.try_get("severity").map_err(StorageError::Query)?;
                Ok(AnomalyRecord {
                    id: row.try_get("id").map_err(StorageError::Query)?,
                    anomaly_type: row.try_get("anomaly_type").map_err(StorageError::Query)?,
                    severity: Severity::parse(&severity_raw).unwrap_or(Severity::Info),
                    message_id: row.try_get("message_id").map_err(StorageError::Query)?,
                    consumer_id: row.try_get("consumer_id").map_err(StorageError::Query)?,
                    queue_name: row.try_get("queue_name").map_err(StorageError::Query)?,
                    details: row.try_get("details").map_err(StorageError::Query)?,
                    created_at: row.try_get("created_at").map_err(StorageError::Query)?,
                })
            })
            .collect()
    }
}

async fn insert_batch(storage: &Storage, anomalies: &[NewAnomaly]) -> Result<(), StorageError> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO anomalies (anomaly_type, severity, message_id, consumer_id, queue_name, \
         details) ",
    );
    qb.push_values(anomalies, |mut b, a| {
        b.push_bind(&a.anomaly_type)
            .push_bind(a.severity.as_str())
            .push_bind(&a.message_id)
            .push_bind(&a.consumer_id)
            .push_bind(&a.queue_name)
            .push_bind(&a.details);
    });
    qb.build()
        .execute(storage.write_pool())
        .await
        .map_err(StorageError::Query)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFires;
    impl AnomalyDetector for AlwaysFires {
        fn name(&self) -> &'static str {
            "always_fires"
        }
        fn description(&self) -> &'static str {
            "test detector"
        }
        fn events(&self) -> &'static [AnomalyEvent] {
            &[AnomalyEvent::Enqueue]
        }
        fn detect(
            &self,
            _ctx: &DetectionContext<'_>,
            _thresholds: &AnomalyThresholds,
        ) -> Option<NewAnomaly> {
            Some(NewAnomaly::new("always_fires", Severity::Info))
        }
    }

    struct Panics;
    impl AnomalyDetector for Panics {
        fn name(&self) -> &'static str {
            "panics"
        }
        fn description(&self) -> &'static str {
            "test detector that panics"
        }
        fn events(&self) -> &'static [AnomalyEvent] {
            &[AnomalyEvent::Enqueue]
        }
        fn detect(
            &self,
            _ctx: &DetectionContext<'_>,
            _thresholds: &AnomalyThresholds,
        ) -> Option<NewAnomaly> {
            panic!("boom")
        }
    }

    fn thresholds() -> AnomalyThresholds {
        AnomalyThresholds::from_env()
    }

    #[test]
    fn test_registry_indexes_by_event() {
        let mut registry = DetectorRegistry::new();
        registry.register(Box::new(AlwaysFires));
        let ctx = DetectionContext::new(AnomalyEvent::Enqueue);
        assert_eq!(registry.run(&ctx, &thresholds()).len(), 1);
        // Not registered for dequeue.
        let ctx = DetectionContext::new(AnomalyEvent::Dequeue);
        assert!(registry.run(&ctx, &thresholds()).is_empty());
    }

    #[test]
    fn test_disabled_detector_does_not_run() {
        let mut registry = DetectorRegistry::new();
        registry.register(Box::new(AlwaysFires));
        assert!(registry.set_enabled("always_fires", false));
        let ctx = DetectionContext::new(AnomalyEvent::Enqueue);
        assert!(registry.run(&ctx, &thresholds()).is_empty());
        assert!(registry.set_enabled("always_fires", true));
        assert_eq!(registry.run(&ctx, &thresholds()).len(), 1);
    }

    #[test]
    fn test_panicking_detector_is_isolated() {
        let mut registry = DetectorRegistry::new();
        registry.register(Box::new(Panics));
        registry.register(Box::new(AlwaysFires));
        let ctx = DetectionContext::new(AnomalyEvent::Enqueue);
        // The panicking detector is skipped, the healthy one still fires.
        let found = registry.run(&ctx, &thresholds());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].anomaly_type, "always_fires");
    }

    #[test]
    fn test_unregister_removes_from_index() {
        let mut registry = DetectorRegistry::new();
        registry.register(Box::new(AlwaysFires));
        assert!(registry.unregister("always_fires"));
        assert!(!registry.unregister("always_fires"));
        let ctx = DetectionContext::new(AnomalyEvent::Enqueue);
        assert!(registry.run(&ctx, &thresholds()).is_empty());
    }

    #[test]
    fn test_run_tags_context_identity() {
        let mut registry = DetectorRegistry::new();
        registry.register(Box::new(AlwaysFires));
        let mut ctx = DetectionContext::new(AnomalyEvent::Enqueue);
        ctx.queue_name = Some("orders");
        ctx.message_id = Some("m-1");
        ctx.consumer_id = Some("worker-7");
        let found = registry.run(&ctx, &thresholds());
        assert_eq!(found[0].queue_name.as_deref(), Some("orders"));
        assert_eq!(found[0].message_id.as_deref(), Some("m-1"));
        assert_eq!(found[0].consumer_id.as_deref(), Some("worker-7"));
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = DetectorRegistry::with_builtins();
        let names = registry.names();
        for expected in [
            "bulk_operation",
            "burst_dequeue",
            "dlq_movement",
            "flash_message",
            "large_payload",
            "lock_stolen",
            "long_processing",
            "near_dlq",
            "queue_cleared",
            "zombie_message",
        ] {
            assert!(names.contains(&expected), "missing builtin {expected}");
        }
    }
}
