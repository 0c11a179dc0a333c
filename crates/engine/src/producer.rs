//! Producer path: single and batch insertion of messages.
//!
//! Batch enqueue is always one multi-row INSERT; the per-request
//! coalescing lives in [`crate::buffer`].

use std::sync::Arc;

use sqlx::QueryBuilder;
use tracing::debug;

use relay_core::config::EngineConfig;
use relay_core::id;
use relay_core::types::{Message, NewMessage, QueueConfig};
use relay_storage::{Storage, StorageError};

use crate::activity::ActivityRecorder;
use crate::anomaly::{AnomalyEngine, AnomalyEvent, DetectionContext};
use crate::error::EngineError;
use crate::registry::QueueRegistry;
use crate::rows::{message_from_row, MESSAGE_COLUMNS};

pub struct Producer {
    storage: Arc<Storage>,
    registry: Arc<QueueRegistry>,
    activity: Arc<ActivityRecorder>,
    anomaly: Arc<AnomalyEngine>,
    defaults: EngineConfig,
}

/// A fully resolved row ready for insertion.
struct ResolvedMessage {
    id: String,
    message_type: Option<String>,
    payload: serde_json::Value,
    priority: i32,
    max_attempts: i32,
    ack_timeout_seconds: i32,
    payload_size: i64,
}

impl Producer {
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

    /// Insert one message with status `queued`. The queue must exist
    /// (checked against the hot config cache).
    pub async fn enqueue(&self, queue: &str, message: NewMessage) -> Result<Message, EngineError> {
        let config = self.registry.get_config(queue).await?;
        let resolved = self.resolve(message, None, &config)?;
        let table = config.queue_type.table();

        let sql = format!(
            "INSERT INTO {table} (id, queue_name, message_type, payload, priority, \
             original_priority, status, max_attempts, ack_timeout_seconds, payload_size) \
             VALUES ($1, $2, $3, $4, $5, $5, 'queued', $6, $7, $8) \
             RETURNING {MESSAGE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&resolved.id)
            .bind(queue)
            .bind(&resolved.message_type)
            .bind(&resolved.payload)
            .bind(resolved.priority)
            .bind(resolved.max_attempts)
            .bind(resolved.ack_timeout_seconds)
            .bind(resolved.payload_size)
            .fetch_one(self.storage.write_pool())
            .await
            .map_err(|e| {
                let err = StorageError::Query(e);
                if err.is_unique_violation() {
                    EngineError::Validation(format!("message id '{}' already exists", resolved.id))
                } else {
                    EngineError::Storage(err)
                }
            })?;
        let inserted = message_from_row(&row)?;

        self.activity
            .log(relay_core::types::NewActivity::for_message("enqueue", &inserted));

        let mut ctx = DetectionContext::new(AnomalyEvent::Enqueue);
        ctx.queue_name = Some(queue);
        ctx.message_id = Some(&inserted.id);
        ctx.message_type = inserted.message_type.as_deref();
        ctx.payload_size = Some(inserted.payload_size);
        self.anomaly.fire(ctx).await;

        debug!(queue = %queue, id = %inserted.id, priority = inserted.priority, "message enqueued");
        Ok(inserted)
    }

    /// Insert a batch of messages sharing a queue and priority, as a single
    /// multi-row INSERT. Results come back in input order.
    pub async fn enqueue_batch(
        &self,
        queue: &str,
        messages: Vec<NewMessage>,
        priority: Option<i32>,
    ) -> Result<Vec<Message>, EngineError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let config = self.registry.get_config(queue).await?;
        let table = config.queue_type.table();

        let resolved: Vec<ResolvedMessage> = messages
            .into_iter()
            .map(|m| self.resolve(m, priority, &config))
            .collect::<Result<_, _>>()?;

        let mut qb = QueryBuilder::new(format!(
            "INSERT INTO {table} (id, queue_name, message_type, payload, priority, \
             original_priority, status, max_attempts, ack_timeout_seconds, payload_size) "
        ));
        qb.push_values(&resolved, |mut b, r| {
            b.push_bind(&r.id)
                .push_bind(queue)
                .push_bind(&r.message_type)
                .push_bind(&r.payload)
                .push_bind(r.priority)
                .push_bind(r.priority)
                .push_bind("queued")
                .push_bind(r.max_attempts)
                .push_bind(r.ack_timeout_seconds)
                .push_bind(r.payload_size);
        });
        qb.push(format!(" RETURNING {MESSAGE_COLUMNS}"));

        let rows = qb
            .build()
            .fetch_all(self.storage.write_pool())
            .await
            .map_err(StorageError::Query)?;

        // Re-order returned rows to match the input.
        let mut by_id: std::collections::HashMap<String, Message> = rows
            .iter()
            .map(|r| message_from_row(r).map(|m| (m.id.clone(), m)))
            .collect::<Result<_, _>>()?;
        let inserted: Vec<Message> = resolved
            .iter()
            .filter_map(|r| by_id.remove(&r.id))
            .collect();

        self.activity.log(
            relay_core::types::NewActivity::new("enqueue_batch")
                .with_context(serde_json::json!({
                    "queue": queue,
                    "count": inserted.len(),
                })),
        );

        let mut ctx = DetectionContext::new(AnomalyEvent::BulkOp);
        ctx.queue_name = Some(queue);
        ctx.operation = Some("enqueue");
        ctx.affected_count = Some(inserted.len() as u64);
        self.anomaly.fire(ctx).await;

        debug!(queue = %queue, count = inserted.len(), "batch enqueued");
        Ok(inserted)
    }

    /// Clamp, default, and size a message before insertion.
    fn resolve(
        &self,
        message: NewMessage,
        shared_priority: Option<i32>,
        config: &QueueConfig,
    ) -> Result<ResolvedMessage, EngineError> {
        let max_priority = self.defaults.max_priority_levels - 1;
        let priority = message
            .priority
            .or(shared_priority)
            .unwrap_or(0)
            .clamp(0, max_priority);
        let max_attempts = message.max_attempts.unwrap_or(config.max_attempts);
        let ack_timeout = message
            .ack_timeout_seconds
            .unwrap_or(config.ack_timeout_seconds);
        if max_attempts < 1 {
            return Err(EngineError::Validation("max_attempts must be >= 1".into()));
        }
        if ack_timeout < 1 {
            return Err(EngineError::Validation("ack_timeout_seconds must be >= 1".into()));
        }
        let payload_size = serde_json::to_vec(&message.payload)
            .map(|b| b.len() as i64)
            .unwrap_or(0);
        Ok(ResolvedMessage {
            id: message.id.unwrap_or_else(id::message_id),
            message_type: message.message_type,
            payload: message.payload,
            priority,
            max_attempts,
            ack_timeout_seconds: ack_timeout,
            payload_size,
        })
    }
}
