//! Administrative operations: moving messages between queues, reviving
//! the DLQ, and clearing queues.
//!
//! Unlike the consumer hot paths these are caller-driven and raise on
//! failure; callers expect binary outcomes. Lock fields stay consistent
//! with the lifecycle invariants: only a `processing` row carries a lock,
//! and an administrative move into `processing` mints a synthetic lock
//! owned by the `manual` actor. That lock cannot be heartbeated, so the
//! reaper will reclaim the row like any other abandoned claim.

use std::sync::Arc;

use tracing::info;

use relay_core::types::{MessageStatus, NewActivity};
use relay_storage::{Storage, StorageError};

use crate::activity::ActivityRecorder;
use crate::anomaly::{AnomalyEngine, AnomalyEvent, DetectionContext};
use crate::error::EngineError;
use crate::registry::QueueRegistry;
use crate::rows::TABLES;

/// Consumer id stamped on rows force-moved into `processing`.
const MANUAL_ACTOR: &str = "manual";

/// Options for [`AdminOps::move_messages`].
#[derive(Debug, Clone, Default)]
pub struct MoveOptions {
    /// Force the rows into this status; `None` keeps the current one.
    pub status: Option<MessageStatus>,
    /// Reset `attempt_count` to zero on the moved rows.
    pub reset_attempts: bool,
}

pub struct AdminOps {
    storage: Arc<Storage>,
    registry: Arc<QueueRegistry>,
    activity: Arc<ActivityRecorder>,
    anomaly: Arc<AnomalyEngine>,
}

impl AdminOps {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<QueueRegistry>,
        activity: Arc<ActivityRecorder>,
        anomaly: Arc<AnomalyEngine>,
    ) -> Self {
        Self {
            storage,
            registry,
            activity,
            anomaly,
        }
    }

    /// Move messages from one queue to another, optionally forcing a
    /// status. Returns the number of rows moved.
    pub async fn move_messages(
        &self,
        ids: &[String],
        from: &str,
        to: &str,
        opts: &MoveOptions,
    ) -> Result<u64, EngineError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let from_config = self.registry.get_config(from).await?;
        let to_config = self.registry.get_config(to).await?;
        let src = from_config.queue_type.table();
        let dst = to_config.queue_type.table();

        let set_clause = move_set_clause(opts);
        let moved = if src == dst {
            let sql = format!(
                "UPDATE {src} SET queue_name = $2{set_clause} \
                 WHERE id = ANY($1) AND queue_name = $3"
            );
            sqlx::query(&sql)
                .bind(ids)
                .bind(to)
                .bind(from)
                .execute(self.storage.write_pool())
                .await
                .map_err(StorageError::Query)?
                .rows_affected()
        } else {
            // Cross-table move: copy with overrides, then delete the originals.
            let mut tx = self.storage.begin().await?;
            let insert = format!(
                "INSERT INTO {dst} (id, queue_name, message_type, payload, priority, \
                 original_priority, status, attempt_count, max_attempts, ack_timeout_seconds, \
                 lock_token, locked_until, consumer_id, created_at, dequeued_at, \
                 acknowledged_at, last_error, payload_size) \
                 SELECT id, $2, message_type, payload, priority, original_priority, \
                 {status_expr}, {attempt_expr}, max_attempts, ack_timeout_seconds, \
                 {lock_exprs}, created_at, dequeued_at, acknowledged_at, last_error, \
                 payload_size FROM {src} WHERE id = ANY($1) AND queue_name = $3",
                status_expr = move_status_expr(opts),
                attempt_expr = if opts.reset_attempts { "0" } else { "attempt_count" },
                lock_exprs = move_lock_exprs(opts),
            );
            let inserted = sqlx::query(&insert)
                .bind(ids)
                .bind(to)
                .bind(from)
                .execute(&mut *tx)
                .await
                .map_err(StorageError::Query)?
                .rows_affected();
            sqlx::query(&format!(
                "DELETE FROM {src} WHERE id = ANY($1) AND queue_name = $2"
            ))
            .bind(ids)
            .bind(from)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Query)?;
            tx.commit().await.map_err(StorageError::Query)?;
            inserted
        };

        self.registry.invalidate(from);
        self.registry.invalidate(to);
        self.activity.log(
            NewActivity::new("move").with_context(serde_json::json!({
                "from": from,
                "to": to,
                "count": moved,
                "status": opts.status.map(|s| s.as_str()),
            })),
        );
        let mut ctx = DetectionContext::new(AnomalyEvent::BulkOp);
        ctx.queue_name = Some(to);
        ctx.operation = Some("move");
        ctx.affected_count = Some(moved);
        self.anomaly.fire(ctx).await;

        info!(from = %from, to = %to, moved, "messages moved");
        Ok(moved)
    }

    /// Revive dead messages: back to `queued` with attempts reset and
    /// original priority restored. Scoped to one queue when given.
    pub async fn requeue_failed(&self, queue: Option<&str>) -> Result<u64, EngineError> {
        let mut total = 0u64;
        for table in TABLES {
            let base = format!(
                "UPDATE {table} SET status = 'queued', attempt_count = 0, \
                 priority = COALESCE(original_priority, priority), lock_token = NULL, \
                 locked_until = NULL, consumer_id = NULL, dequeued_at = NULL, last_error = NULL \
                 WHERE status = 'dead'"
            );
            let result = match queue {
                Some(name) => {
                    sqlx::query(&format!("{base} AND queue_name = $1"))
                        .bind(name)
                        .execute(self.storage.write_pool())
                        .await
                }
                None => sqlx::query(&base).execute(self.storage.write_pool()).await,
            }
            .map_err(StorageError::Query)?;
            total += result.rows_affected();
        }

        self.activity.log(
            NewActivity::new("requeue").with_context(serde_json::json!({
                "queue": queue,
                "count": total,
                "source": "dlq",
            })),
        );
        let mut ctx = DetectionContext::new(AnomalyEvent::BulkOp);
        ctx.queue_name = queue;
        ctx.operation = Some("requeue");
        ctx.affected_count = Some(total);
        self.anomaly.fire(ctx).await;

        info!(queue = queue.unwrap_or("*"), requeued = total, "failed messages requeued");
        Ok(total)
    }

    /// Remove every message in a queue. Destructive; always recorded as a
    /// critical anomaly.
    pub async fn clear(&self, queue: &str) -> Result<u64, EngineError> {
        let removed = self.registry.purge(queue, None).await?;

        self.activity.log(
            NewActivity::new("clear")
                .with_context(serde_json::json!({ "queue": queue, "removed": removed })),
        );
        let mut ctx = DetectionContext::new(AnomalyEvent::Clear);
        ctx.queue_name = Some(queue);
        ctx.affected_count = Some(removed);
        self.anomaly.fire(ctx).await;

        info!(queue = %queue, removed, "queue cleared");
        Ok(removed)
    }
}

/// SET fragment for a same-table move, keyed on the target status.
fn move_set_clause(opts: &MoveOptions) -> String {
    let mut clause = String::new();
    if opts.reset_attempts {
        clause.push_str(", attempt_count = 0");
    }
    match opts.status {
        None => {}
        Some(MessageStatus::Processing) => {
            // Synthetic claim by the manual actor; reaped once overdue.
            clause.push_str(
                ", status = 'processing', \
                 lock_token = substr(md5(random()::text), 1, 12), \
                 locked_until = NOW() + make_interval(secs => ack_timeout_seconds::double precision), \
                 consumer_id = 'manual', dequeued_at = NOW()",
            );
        }
        Some(status) => {
            clause.push_str(&format!(
                ", status = '{}', lock_token = NULL, locked_until = NULL, consumer_id = NULL",
                status.as_str()
            ));
        }
    }
    clause
}

/// SELECT expression for `status` in a cross-table move.
fn move_status_expr(opts: &MoveOptions) -> String {
    match opts.status {
        None => "status".to_string(),
        Some(status) => format!("'{}'", status.as_str()),
    }
}

/// SELECT expressions for `lock_token, locked_until, consumer_id` in a
/// cross-table move.
fn move_lock_exprs(opts: &MoveOptions) -> String {
    match opts.status {
        None => "lock_token, locked_until, consumer_id".to_string(),
        Some(MessageStatus::Processing) => format!(
            "substr(md5(random()::text), 1, 12), \
             NOW() + make_interval(secs => ack_timeout_seconds::double precision), '{MANUAL_ACTOR}'"
        ),
        Some(_) => "NULL, NULL, NULL".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_table_clause_plain_move_touches_nothing_else() {
        let clause = move_set_clause(&MoveOptions::default());
        assert!(clause.is_empty());
    }

    #[test]
    fn test_same_table_clause_terminal_status_clears_lock() {
        let clause = move_set_clause(&MoveOptions {
            status: Some(MessageStatus::Dead),
            reset_attempts: false,
        });
        assert!(clause.contains("status = 'dead'"));
        assert!(clause.contains("lock_token = NULL"));
        assert!(clause.contains("locked_until = NULL"));
    }

    #[test]
    fn test_manual_processing_move_mints_lock() {
        let clause = move_set_clause(&MoveOptions {
            status: Some(MessageStatus::Processing),
            reset_attempts: true,
        });
        assert!(clause.contains("attempt_count = 0"));
        assert!(clause.contains("consumer_id = 'manual'"));
        assert!(clause.contains("lock_token = substr(md5(random()::text), 1, 12)"));
        assert!(clause.contains("locked_until = NOW()"));
    }

    #[test]
    fn test_cross_table_lock_exprs_follow_status() {
        assert_eq!(
            move_lock_exprs(&MoveOptions::default()),
            "lock_token, locked_until, consumer_id"
        );
        assert_eq!(
            move_lock_exprs(&MoveOptions {
                status: Some(MessageStatus::Acknowledged),
                reset_attempts: false,
            }),
            "NULL, NULL, NULL"
        );
        assert!(move_lock_exprs(&MoveOptions {
            status: Some(MessageStatus::Processing),
            reset_attempts: false,
        })
        .contains(MANUAL_ACTOR));
    }
}
