//! Dequeue core: atomic claim of the next queued message.
//!
//! Selection and claim happen in one statement: a skip-locked CTE picks
//! the best candidate (`priority DESC, created_at ASC`) and the enclosing
//! UPDATE flips it to `processing`, stamps a fresh lock token, and returns
//! the full row. Competing consumers skip each other's row locks, so a
//! queued row is claimed at most once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use relay_core::config::EngineConfig;
use relay_core::id;
use relay_core::types::{Claim, NewActivity};
use relay_storage::{Storage, StorageError};

use crate::activity::ActivityRecorder;
use crate::anomaly::{AnomalyEngine, AnomalyEvent, DetectionContext};
use crate::error::EngineError;
use crate::registry::QueueRegistry;
use crate::rows::message_from_row;

/// First long-poll sleep; doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct DequeueOptions {
    /// How long to long-poll for. Zero means a single attempt.
    pub timeout: Duration,
    /// Overrides the message's visibility timeout for this claim.
    pub ack_timeout_seconds: Option<i32>,
    /// Only claim messages of this type.
    pub type_filter: Option<String>,
    /// Recorded on the claimed row and used for per-consumer stats.
    pub consumer_id: Option<String>,
}

pub struct DequeueCore {
    storage: Arc<Storage>,
    registry: Arc<QueueRegistry>,
    activity: Arc<ActivityRecorder>,
    anomaly: Arc<AnomalyEngine>,
    defaults: EngineConfig,
}

impl DequeueCore {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<QueueRegistry>,
        activity: Arc<ActivityRecorder>,
        anomaly: Arc<AnomalyEngine>,
        defaults: EngineConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            activity,
            anomaly,
            defaults,
        }
    }

    /// Claim the next message, long-polling up to `opts.timeout`.
    ///
    /// Returns `None` on timeout; the deadline is honoured exactly even
    /// mid-backoff.
    pub async fn dequeue(
        &self,
        queue: &str,
        opts: DequeueOptions,
    ) -> Result<Option<Claim>, EngineError> {
        let config = self.registry.get_config(queue).await?;
        let table = config.queue_type.table();
        let deadline = Instant::now() + opts.timeout;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if let Some(claim) = self.claim_once(queue, table, &opts).await? {
                return Ok(Some(claim));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let sleep = backoff.min(deadline - now);
            tokio::time::sleep(sleep).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn claim_once(
        &self,
        queue: &str,
        table: &str,
        opts: &DequeueOptions,
    ) -> Result<Option<Claim>, EngineError> {
        let type_clause = if opts.type_filter.is_some() {
            " AND message_type = $5"
        } else {
            ""
        };
        let sql = format!(
            "WITH candidate AS ( \
                 SELECT id FROM {table} \
                 WHERE queue_name = $1 AND status = 'queued'{type_clause} \
                 ORDER BY priority DESC, created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE {table} m \
             SET status = 'processing', \
                 lock_token = $2, \
                 locked_until = NOW() + make_interval(secs => \
                     COALESCE($3::int, m.ack_timeout_seconds)::double precision), \
                 consumer_id = $4, \
                 dequeued_at = NOW(), \
                 attempt_count = m.attempt_count + 1 \
             FROM candidate c \
             WHERE m.id = c.id \
             RETURNING {columns}",
            columns = crate::rows::MESSAGE_COLUMNS
        );

        let token = id::lock_token();
        let mut query = sqlx::query(&sql)
            .bind(queue)
            .bind(&token)
            .bind(opts.ack_timeout_seconds)
            .bind(&opts.consumer_id);
        if let Some(filter) = &opts.type_filter {
            query = query.bind(filter);
        }
        let Some(row) = query
            .fetch_optional(self.storage.write_pool())
            .await
            .map_err(StorageError::Query)?
        else {
            return Ok(None);
        };
        let message = message_from_row(&row)?;

        let processing_started_at = message.dequeued_at.unwrap_or_else(Utc::now);
        let time_in_queue_ms = (processing_started_at - message.created_at).num_milliseconds();

        self.activity.log(
            NewActivity::for_message("dequeue", &message)
                .with_context(serde_json::json!({ "time_in_queue_ms": time_in_queue_ms })),
        );

        let window_count = match &opts.consumer_id {
            Some(consumer) => Some(self.anomaly.stats().record_dequeue(consumer).await),
            None => None,
        };
        let effective_max = message.max_attempts.min(self.defaults.max_attempts);
        let mut ctx = DetectionContext::new(AnomalyEvent::Dequeue);
        ctx.queue_name = Some(queue);
        ctx.message_id = Some(&message.id);
        ctx.message_type = message.message_type.as_deref();
        ctx.consumer_id = opts.consumer_id.as_deref();
        ctx.time_in_queue_ms = Some(time_in_queue_ms);
        ctx.attempts_remaining = Some(effective_max - message.attempt_count);
        ctx.recent_dequeues_in_window = window_count;
        self.anomaly.fire(ctx).await;

        debug!(
            queue = %queue,
            id = %message.id,
            attempt = message.attempt_count,
            "message claimed"
        );
        Ok(Some(Claim {
            lock_token: token,
            attempt_count: message.attempt_count,
            processing_started_at,
            message,
        }))
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}
