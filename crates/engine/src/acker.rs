//! Ack / nack / touch: fencing-token-validated transitions out of
//! `processing`.
//!
//! Every transition is a conditional UPDATE whose WHERE re-checks status
//! (and token, when presented) inside the statement, so a racing reaper
//! or competing consumer can never double-apply a transition: the loser
//! simply matches zero rows and gets a typed failure.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use relay_core::config::EngineConfig;
use relay_core::types::{Message, MessageStatus, NewActivity};
use relay_storage::{Storage, StorageError};

use crate::activity::ActivityRecorder;
use crate::anomaly::{AnomalyEngine, AnomalyEvent, DetectionContext};
use crate::error::EngineError;
use crate::rows::{find_message, message_from_row, MESSAGE_COLUMNS};

/// Result of a successful touch.
#[derive(Debug, Clone, Serialize)]
pub struct TouchReceipt {
    pub new_timeout_at: DateTime<Utc>,
    pub lock_token: String,
}

/// What a successful nack did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back in `queued` with its original priority restored.
    Requeued { attempts_remaining: i32 },
    /// Attempts exhausted; now `dead`.
    MovedToDlq,
}

pub struct AckCore {
    storage: Arc<Storage>,
    activity: Arc<ActivityRecorder>,
    anomaly: Arc<AnomalyEngine>,
    defaults: EngineConfig,
}

impl AckCore {
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
        }
    }

    /// Acknowledge a processing message.
    ///
    /// A missing `lock_token` is accepted for backward compatibility;
    /// callers are strongly encouraged to always present one.
    pub async fn ack(&self, id: &str, lock_token: Option<&str>) -> Result<(), EngineError> {
        let (message, table) = self.load_processing(id, lock_token, AnomalyEvent::Ack).await?;

        let sql = match lock_token {
            Some(_) => format!(
                "UPDATE {table} SET status = 'acknowledged', acknowledged_at = NOW(), \
                 lock_token = NULL, locked_until = NULL \
                 WHERE id = $1 AND status = 'processing' AND lock_token = $2 \
                 RETURNING {MESSAGE_COLUMNS}"
            ),
            None => format!(
                "UPDATE {table} SET status = 'acknowledged', acknowledged_at = NOW(), \
                 lock_token = NULL, locked_until = NULL \
                 WHERE id = $1 AND status = 'processing' \
                 RETURNING {MESSAGE_COLUMNS}"
            ),
        };
        let mut query = sqlx::query(&sql).bind(id);
        if let Some(token) = lock_token {
            query = query.bind(token);
        }
        let Some(row) = query
            .fetch_optional(self.storage.write_pool())
            .await
            .map_err(StorageError::Query)?
        else {
            // Lost the race to the reaper or another transition.
            return Err(EngineError::UpdateFailed(id.to_string()));
        };
        let acked = message_from_row(&row)?;

        let processing_time_ms = match (acked.dequeued_at, acked.acknowledged_at) {
            (Some(started), Some(done)) => (done - started).num_milliseconds(),
            _ => 0,
        };
        self.activity.log(
            NewActivity::for_message("ack", &message).with_processing_time(processing_time_ms),
        );
        if let Some(consumer) = message.consumer_id.as_deref() {
            self.anomaly.stats().record_ack(consumer).await;
        }

        let mut ctx = DetectionContext::new(AnomalyEvent::Ack);
        ctx.queue_name = Some(&message.queue_name);
        ctx.message_id = Some(&message.id);
        ctx.consumer_id = message.consumer_id.as_deref();
        ctx.processing_time_ms = Some(processing_time_ms);
        ctx.ack_timeout_seconds = Some(message.ack_timeout_seconds);
        self.anomaly.fire(ctx).await;

        debug!(id = %id, processing_time_ms, "message acknowledged");
        Ok(())
    }

    /// Negative-acknowledge a processing message: requeue it with its
    /// original priority, or promote it to the DLQ once attempts are
    /// exhausted.
    pub async fn nack(
        &self,
        id: &str,
        lock_token: Option<&str>,
        error_reason: Option<&str>,
    ) -> Result<NackOutcome, EngineError> {
        let (message, table) = self
            .load_processing(id, lock_token, AnomalyEvent::Nack)
            .await?;

        let effective_max = message.max_attempts.min(self.defaults.max_attempts);
        let to_dlq = message.attempt_count >= effective_max;

        let set_clause = if to_dlq {
            "status = 'dead', lock_token = NULL, locked_until = NULL, \
             last_error = COALESCE($2, last_error)"
        } else {
            "status = 'queued', priority = COALESCE(original_priority, priority), \
             lock_token = NULL, locked_until = NULL, dequeued_at = NULL, consumer_id = NULL, \
             last_error = COALESCE($2, last_error)"
        };
        let sql = match lock_token {
            Some(_) => format!(
                "UPDATE {table} SET {set_clause} \
                 WHERE id = $1 AND status = 'processing' AND lock_token = $3 RETURNING id"
            ),
            None => format!(
                "UPDATE {table} SET {set_clause} \
                 WHERE id = $1 AND status = 'processing' RETURNING id"
            ),
        };
        let mut query = sqlx::query(&sql).bind(id).bind(error_reason);
        if let Some(token) = lock_token {
            query = query.bind(token);
        }
        let updated = query
            .fetch_optional(self.storage.write_pool())
            .await
            .map_err(StorageError::Query)?;
        if updated.is_none() {
            // Row left `processing` between our read and the update.
            return Err(EngineError::InvalidState {
                id: id.to_string(),
                status: "transitioned".to_string(),
            });
        }

        if let Some(consumer) = message.consumer_id.as_deref() {
            self.anomaly.stats().record_failure(consumer).await;
        }

        let outcome = if to_dlq {
            self.activity.log(
                NewActivity::for_message("move_to_dlq", &message).with_context(
                    serde_json::json!({ "reason": error_reason, "attempts": message.attempt_count }),
                ),
            );
            NackOutcome::MovedToDlq
        } else {
            self.activity.log(
                NewActivity::for_message("nack", &message)
                    .with_context(serde_json::json!({ "reason": error_reason })),
            );
            NackOutcome::Requeued {
                attempts_remaining: effective_max - message.attempt_count,
            }
        };

        let mut ctx = DetectionContext::new(AnomalyEvent::Nack);
        ctx.queue_name = Some(&message.queue_name);
        ctx.message_id = Some(&message.id);
        ctx.consumer_id = message.consumer_id.as_deref();
        ctx.attempts_remaining = Some(effective_max - message.attempt_count);
        ctx.moved_to_dlq = to_dlq;
        self.anomaly.fire(ctx).await;

        debug!(id = %id, to_dlq, "message nacked");
        Ok(outcome)
    }

    /// Extend the visibility timeout of a processing message. The lock
    /// token is required and is not rotated: touch extends, never reclaims.
    pub async fn touch(
        &self,
        id: &str,
        lock_token: &str,
        extend_seconds: Option<i32>,
    ) -> Result<TouchReceipt, EngineError> {
        let sql_for = |table: &str| {
            format!(
                "UPDATE {table} SET locked_until = NOW() + make_interval(secs => \
                 COALESCE($3::int, ack_timeout_seconds)::double precision) \
                 WHERE id = $1 AND status = 'processing' AND lock_token = $2 \
                 RETURNING locked_until"
            )
        };
        for table in crate::rows::TABLES {
            let row = sqlx::query(&sql_for(table))
                .bind(id)
                .bind(lock_token)
                .bind(extend_seconds)
                .fetch_optional(self.storage.write_pool())
                .await
                .map_err(StorageError::Query)?;
            if let Some(row) = row {
                use sqlx::Row;
                let new_timeout_at: DateTime<Utc> =
                    row.try_get("locked_until").map_err(StorageError::Query)?;
                debug!(id = %id, %new_timeout_at, "lock extended");
                return Ok(TouchReceipt {
                    new_timeout_at,
                    lock_token: lock_token.to_string(),
                });
            }
        }
        // Zero rows matched anywhere: absent row vs. stolen/expired lock.
        match find_message(&self.storage, id).await? {
            None => Err(EngineError::NotFound(id.to_string())),
            Some(_) => Err(EngineError::LockLost(id.to_string())),
        }
    }

    /// Shared ack/nack validation: load the row, require `processing`,
    /// and verify the fencing token when one is presented.
    async fn load_processing(
        &self,
        id: &str,
        lock_token: Option<&str>,
        event: AnomalyEvent,
    ) -> Result<(Message, &'static str), EngineError> {
        let Some((message, table)) = find_message(&self.storage, id).await? else {
            return Err(EngineError::NotFound(id.to_string()));
        };
        if message.status != MessageStatus::Processing {
            return Err(EngineError::InvalidState {
                id: id.to_string(),
                status: message.status.to_string(),
            });
        }
        if let Some(presented) = lock_token {
            if message.lock_token.as_deref() != Some(presented) {
                let mut ctx = DetectionContext::new(event);
                ctx.queue_name = Some(&message.queue_name);
                ctx.message_id = Some(&message.id);
                ctx.consumer_id = message.consumer_id.as_deref();
                ctx.presented_token = Some(presented);
                ctx.current_token = message.lock_token.as_deref();
                self.anomaly.fire(ctx).await;
                return Err(EngineError::LockLost(id.to_string()));
            }
        }
        Ok((message, table))
    }
}
