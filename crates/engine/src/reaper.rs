//! Reaper: periodic recovery of locks abandoned by dead or slow consumers.
//!
//! Each pass scans for `processing` rows whose `locked_until` has passed,
//! requeues those with attempts left, and promotes the rest to the DLQ.
//! Both moves are batched conditional updates: the WHERE re-checks
//! status and overdue-ness inside the statement, so two reaper instances
//! can never reap the same row twice. An optional advisory lock lets
//! co-located instances skip redundant passes entirely.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, info, warn};

use relay_core::config::EngineConfig;
use relay_core::types::NewActivity;
use relay_storage::{Storage, StorageError};

use crate::activity::ActivityRecorder;
use crate::anomaly::{AnomalyEngine, AnomalyEvent, DetectionContext};
use crate::error::EngineError;
use crate::rows::TABLES;

/// Advisory lock key guarding a reaper pass ("RELAY" in ASCII).
const REAPER_LOCK_KEY: i64 = 0x52_45_4C_41_59;

const REQUEUE_ERROR: &str = "Timeout - requeued";
const DLQ_ERROR: &str = "Timeout after max attempts";

/// A row fetched by the overdue scan.
struct OverdueRow {
    id: String,
    queue_name: String,
    message_type: Option<String>,
    consumer_id: Option<String>,
    attempt_count: i32,
    max_attempts: i32,
    ack_timeout_seconds: i32,
    locked_until: DateTime<Utc>,
}

pub struct Reaper {
    storage: Arc<Storage>,
    activity: Arc<ActivityRecorder>,
    anomaly: Arc<AnomalyEngine>,
    defaults: EngineConfig,
    last_pass_reaped: AtomicU64,
    total_reaped: AtomicU64,
}

impl Reaper {
    pub fn new(
        storage: Arc<Storage>,
        activity: Arc<ActivityRecorder>,
        anomaly: Arc<AnomalyEngine>,
        defaults: EngineConfig,
    ) -> Self {
        Self {
            storage,
            activity,
            anomaly,
            defaults,
            last_pass_reaped: AtomicU64::new(0),
            total_reaped: AtomicU64::new(0),
        }
    }

    pub fn last_pass_reaped(&self) -> u64 {
        self.last_pass_reaped.load(Ordering::Relaxed)
    }

    pub fn total_reaped(&self) -> u64 {
        self.total_reaped.load(Ordering::Relaxed)
    }

    /// Run one reaper pass over both backing tables. Returns the total
    /// number of rows requeued or promoted to the DLQ.
    pub async fn run_pass(&self) -> Result<u64, EngineError> {
        // The advisory lock is session-scoped: hold one connection for the
        // whole pass so lock and unlock pair up.
        let mut guard_conn = None;
        if self.defaults.reaper_advisory_lock {
            let mut conn = self
                .storage
                .write_pool()
                .acquire()
                .await
                .map_err(StorageError::Query)?;
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(REAPER_LOCK_KEY)
                .fetch_one(&mut *conn)
                .await
                .map_err(StorageError::Query)?;
            if !acquired {
                debug!("another reaper holds the pass lock; skipping");
                return Ok(0);
            }
            guard_conn = Some(conn);
        }

        let mut total = 0u64;
        let mut pass_result = Ok(());
        for table in TABLES {
            match self.reap_table(table).await {
                Ok(n) => total += n,
                Err(e) => {
                    pass_result = Err(e);
                    break;
                }
            }
        }

        if let Some(mut conn) = guard_conn {
            if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(REAPER_LOCK_KEY)
                .execute(&mut *conn)
                .await
            {
                warn!("failed to release reaper advisory lock: {}", e);
            }
        }
        pass_result?;

        self.last_pass_reaped.store(total, Ordering::Relaxed);
        self.total_reaped.fetch_add(total, Ordering::Relaxed);
        if total > 0 {
            info!(reaped = total, "reaper pass complete");
        }
        Ok(total)
    }

    async fn reap_table(&self, table: &str) -> Result<u64, EngineError> {
        let rows = sqlx::query(&format!(
            "SELECT id, queue_name, message_type, consumer_id, attempt_count, max_attempts, \
             ack_timeout_seconds, locked_until \
             FROM {table} WHERE status = 'processing' AND locked_until < NOW() \
             ORDER BY locked_until ASC LIMIT $1"
        ))
        .bind(self.defaults.requeue_batch_size)
        .fetch_all(self.storage.write_pool())
        .await
        .map_err(StorageError::Query)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut overdue = Vec::with_capacity(rows.len());
        for row in &rows {
            overdue.push(OverdueRow {
                id: row.try_get("id").map_err(StorageError::Query)?,
                queue_name: row.try_get("queue_name").map_err(StorageError::Query)?,
                message_type: row.try_get("message_type").map_err(StorageError::Query)?,
                consumer_id: row.try_get("consumer_id").map_err(StorageError::Query)?,
                attempt_count: row.try_get("attempt_count").map_err(StorageError::Query)?,
                max_attempts: row.try_get("max_attempts").map_err(StorageError::Query)?,
                ack_timeout_seconds: row
                    .try_get("ack_timeout_seconds")
                    .map_err(StorageError::Query)?,
                locked_until: row.try_get("locked_until").map_err(StorageError::Query)?,
            });
        }

        // Partition: attempts left → requeue, exhausted → DLQ.
        let (dlq, requeue): (Vec<&OverdueRow>, Vec<&OverdueRow>) = overdue.iter().partition(|r| {
            r.attempt_count >= r.max_attempts.min(self.defaults.max_attempts)
        });

        let requeue_ids: Vec<String> = requeue.iter().map(|r| r.id.clone()).collect();
        let dlq_ids: Vec<String> = dlq.iter().map(|r| r.id.clone()).collect();

        let requeued = self
            .apply_batch(
                table,
                &requeue_ids,
                "status = 'queued', priority = COALESCE(original_priority, priority), \
                 lock_token = NULL, locked_until = NULL, consumer_id = NULL, dequeued_at = NULL",
                REQUEUE_ERROR,
            )
            .await?;
        let moved = self
            .apply_batch(
                table,
                &dlq_ids,
                "status = 'dead', lock_token = NULL, locked_until = NULL",
                DLQ_ERROR,
            )
            .await?;

        // Activity and anomalies only for rows this pass actually
        // transitioned; a concurrent ack or second reaper may have won some.
        // Detection goes through the registry so zombie_message honours
        // enable/disable and detector isolation like every other event.
        let now = Utc::now();
        let mut activities = Vec::new();
        let mut anomalies = Vec::new();
        for row in &overdue {
            let reaped_as = if requeued.contains(&row.id) {
                "requeue"
            } else if moved.contains(&row.id) {
                "move_to_dlq"
            } else {
                continue;
            };
            let overdue_ms = (now - row.locked_until).num_milliseconds();
            let mut entry = NewActivity::new(reaped_as);
            entry.message_id = Some(row.id.clone());
            entry.message_type = row.message_type.clone();
            entry.consumer_id = row.consumer_id.clone();
            entry.queue_name = Some(row.queue_name.clone());
            entry.attempt_count = Some(row.attempt_count);
            entry.context = serde_json::json!({ "overdue_ms": overdue_ms, "by": "reaper" });
            activities.push(entry);

            let mut ctx = DetectionContext::new(AnomalyEvent::Reap);
            ctx.queue_name = Some(&row.queue_name);
            ctx.message_id = Some(&row.id);
            ctx.message_type = row.message_type.as_deref();
            ctx.consumer_id = row.consumer_id.as_deref();
            ctx.overdue_ms = Some(overdue_ms);
            ctx.expected_timeout_ms = Some(row.ack_timeout_seconds as i64 * 1000);
            anomalies.extend(self.anomaly.detect(&ctx));
        }
        self.activity.log_batch(activities);
        self.anomaly.persist(anomalies).await;

        Ok((requeued.len() + moved.len()) as u64)
    }

    /// One batched conditional update; returns the ids that transitioned.
    async fn apply_batch(
        &self,
        table: &str,
        ids: &[String],
        set_clause: &str,
        last_error: &str,
    ) -> Result<Vec<String>, EngineError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "UPDATE {table} SET {set_clause}, last_error = $2 \
             WHERE id = ANY($1) AND status = 'processing' AND locked_until < NOW() \
             RETURNING id"
        ))
        .bind(ids)
        .bind(last_error)
        .fetch_all(self.storage.write_pool())
        .await
        .map_err(StorageError::Query)?;
        rows.iter()
            .map(|r| r.try_get("id").map_err(|e| StorageError::Query(e).into()))
            .collect()
    }

    /// Spawn the periodic reaping task.
    pub fn spawn(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let reaper = self.clone();
        let interval_ms = reaper.defaults.overdue_check_interval_ms;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(100)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                if let Err(e) = reaper.run_pass().await {
                    warn!("reaper pass failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_respects_global_cap() {
        // A row whose own max_attempts exceeds the global cap is still
        // DLQ'd once the global cap is reached.
        let row = OverdueRow {
            id: "m1".into(),
            queue_name: "q".into(),
            message_type: None,
            consumer_id: None,
            attempt_count: 3,
            max_attempts: 10,
            ack_timeout_seconds: 30,
            locked_until: Utc::now(),
        };
        let global_cap = 3;
        assert!(row.attempt_count >= row.max_attempts.min(global_cap));
    }

    #[tokio::test]
    async fn test_reap_context_flows_through_zombie_detector() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/relay_unused")
            .expect("lazy pool");
        let engine = AnomalyEngine::new(
            Arc::new(Storage::from_pools(pool, None)),
            relay_core::config::AnomalyThresholds::from_env(),
        );

        // Overdue past timeout × multiplier: the registered detector fires.
        let mut ctx = DetectionContext::new(AnomalyEvent::Reap);
        ctx.message_id = Some("m1");
        ctx.overdue_ms = Some(70_000);
        ctx.expected_timeout_ms = Some(30_000);
        let found = engine.detect(&ctx);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].anomaly_type, "zombie_message");
        assert_eq!(found[0].message_id.as_deref(), Some("m1"));

        // Within bounds: silent.
        ctx.overdue_ms = Some(50_000);
        assert!(engine.detect(&ctx).is_empty());

        // Disabling the detector disables live zombie detection.
        ctx.overdue_ms = Some(70_000);
        engine
            .registry()
            .write()
            .expect("detector registry lock")
            .set_enabled("zombie_message", false);
        assert!(engine.detect(&ctx).is_empty());
    }
}
