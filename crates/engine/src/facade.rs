//! Operation facade: the stable, typed surface transports consume.
//!
//! [`Relay`] composes every engine component, owns the background tasks
//! (reaper, activity flusher, enqueue buffer timer), and maps each
//! operation onto tagged outcomes. Immediate change notifications go out
//! on the configured NOTIFY channel; the polled broadcaster covers
//! deployments that mutate the store out-of-band.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use relay_core::config::RelayConfig;
use relay_core::types::{
    ActivityEntry, AnomalyRecord, Claim, ConsumerStats, Message, MessageStatus, NewActivity,
    NewMessage, QueueDefinition,
};
use relay_storage::{ChannelHub, Health, Storage};

use crate::acker::{AckCore, NackOutcome, TouchReceipt};
use crate::activity::{ActivityFilter, ActivityRecorder};
use crate::admin::{AdminOps, MoveOptions};
use crate::anomaly::{AnomalyEngine, AnomalyEvent, DetectionContext};
use crate::broadcast::{ChangeBroadcaster, ChangeEvent};
use crate::buffer::EnqueueBuffer;
use crate::dequeue::{DequeueCore, DequeueOptions};
use crate::error::EngineError;
use crate::producer::Producer;
use crate::reaper::Reaper;
use crate::registry::{NewQueue, QueueConfigPatch, QueueRegistry};
use crate::rows::TABLES;

/// Snapshot returned by [`Relay::get_status`].
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub health: Health,
    pub queues: Vec<QueueDefinition>,
    pub totals: StatusTotals,
}

#[derive(Debug, Default, Serialize)]
pub struct StatusTotals {
    pub queued: i64,
    pub processing: i64,
    pub acknowledged: i64,
    pub dead: i64,
    pub archived: i64,
}

/// Snapshot returned by [`Relay::get_metrics`].
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub totals: StatusTotals,
    pub reaper_last_pass: u64,
    pub reaper_total: u64,
    pub activity_buffered: usize,
    pub enqueue_buffered: usize,
    pub change_subscribers: usize,
}

pub struct Relay {
    storage: Arc<Storage>,
    hub: Arc<ChannelHub>,
    registry: Arc<QueueRegistry>,
    producer: Arc<Producer>,
    buffer: Option<Arc<EnqueueBuffer>>,
    dequeue: Arc<DequeueCore>,
    acker: Arc<AckCore>,
    reaper: Arc<Reaper>,
    activity: Arc<ActivityRecorder>,
    anomaly: Arc<AnomalyEngine>,
    broadcaster: Arc<ChangeBroadcaster>,
    admin: AdminOps,
    change_channel: String,
    shutdown: Arc<AtomicBool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Relay {
    /// Connect to the database and assemble the engine.
    pub async fn start(config: RelayConfig) -> Result<Self, EngineError> {
        config.log_summary();
        let storage = Arc::new(Storage::connect(&config.database).await?);
        Self::with_storage(storage, config).await
    }

    /// Assemble the engine on an existing storage handle. Used by tests.
    pub async fn with_storage(
        storage: Arc<Storage>,
        config: RelayConfig,
    ) -> Result<Self, EngineError> {
        let engine = config.engine;
        let hub = Arc::new(ChannelHub::start(storage.write_pool().clone()).await?);
        let activity = Arc::new(ActivityRecorder::new(
            storage.clone(),
            engine.activity_log_enabled,
            engine.activity_buffer_max_size,
        ));
        let anomaly = Arc::new(AnomalyEngine::new(storage.clone(), config.anomaly.clone()));
        let registry = Arc::new(QueueRegistry::new(storage.clone(), engine.clone()));
        let producer = Arc::new(Producer::new(
            storage.clone(),
            registry.clone(),
            activity.clone(),
            anomaly.clone(),
            engine.clone(),
        ));
        let buffer = engine
            .enqueue_buffer_enabled
            .then(|| {
                Arc::new(EnqueueBuffer::new(
                    producer.clone(),
                    engine.enqueue_buffer_max_size,
                    engine.enqueue_buffer_max_wait_ms,
                ))
            });
        let dequeue = Arc::new(DequeueCore::new(
            storage.clone(),
            registry.clone(),
            activity.clone(),
            anomaly.clone(),
            engine.clone(),
        ));
        let acker = Arc::new(AckCore::new(
            storage.clone(),
            activity.clone(),
            anomaly.clone(),
            engine.clone(),
        ));
        let reaper = Arc::new(Reaper::new(
            storage.clone(),
            activity.clone(),
            anomaly.clone(),
            engine.clone(),
        ));
        let broadcaster = Arc::new(ChangeBroadcaster::new(
            storage.clone(),
            engine.broadcast_poll_interval_ms,
        ));
        let admin = AdminOps::new(
            storage.clone(),
            registry.clone(),
            activity.clone(),
            anomaly.clone(),
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut tasks = vec![
            reaper.spawn(shutdown.clone()),
            activity.spawn_flusher(engine.activity_buffer_flush_ms, shutdown.clone()),
        ];
        if let Some(buffer) = &buffer {
            tasks.push(buffer.spawn_timer(shutdown.clone()));
        }

        info!("relay engine started");
        Ok(Self {
            storage,
            hub,
            registry,
            producer,
            buffer,
            dequeue,
            acker,
            reaper,
            activity,
            anomaly,
            broadcaster,
            admin,
            change_channel: engine.change_channel,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    // ── Producer surface ──────────────────────────────────────

    pub async fn enqueue(&self, queue: &str, message: NewMessage) -> Result<Message, EngineError> {
        let inserted = match &self.buffer {
            Some(buffer) => buffer.submit(queue, message, None).await?,
            None => self.producer.enqueue(queue, message).await?,
        };
        self.emit_change(
            "enqueue",
            serde_json::json!({ "queue": queue, "id": inserted.id, "priority": inserted.priority }),
        )
        .await;
        Ok(inserted)
    }

    pub async fn enqueue_batch(
        &self,
        queue: &str,
        messages: Vec<NewMessage>,
        priority: Option<i32>,
    ) -> Result<Vec<Message>, EngineError> {
        let inserted = self.producer.enqueue_batch(queue, messages, priority).await?;
        self.emit_change(
            "enqueue",
            serde_json::json!({ "queue": queue, "count": inserted.len() }),
        )
        .await;
        Ok(inserted)
    }

    // ── Consumer surface ──────────────────────────────────────

    pub async fn dequeue(
        &self,
        queue: &str,
        opts: DequeueOptions,
    ) -> Result<Option<Claim>, EngineError> {
        let claim = self.dequeue.dequeue(queue, opts).await?;
        if let Some(claim) = &claim {
            self.emit_change(
                "dequeue",
                serde_json::json!({ "queue": queue, "id": claim.message.id }),
            )
            .await;
        }
        Ok(claim)
    }

    pub async fn ack(&self, id: &str, lock_token: Option<&str>) -> Result<(), EngineError> {
        self.acker.ack(id, lock_token).await?;
        self.emit_change("acknowledge", serde_json::json!({ "id": id })).await;
        Ok(())
    }

    pub async fn nack(
        &self,
        id: &str,
        lock_token: Option<&str>,
        error_reason: Option<&str>,
    ) -> Result<NackOutcome, EngineError> {
        let outcome = self.acker.nack(id, lock_token, error_reason).await?;
        let event = match outcome {
            NackOutcome::MovedToDlq => "move_to_dlq",
            NackOutcome::Requeued { .. } => "requeue",
        };
        self.emit_change(event, serde_json::json!({ "id": id })).await;
        Ok(outcome)
    }

    pub async fn touch(
        &self,
        id: &str,
        lock_token: &str,
        extend_seconds: Option<i32>,
    ) -> Result<TouchReceipt, EngineError> {
        self.acker.touch(id, lock_token, extend_seconds).await
    }

    // ── Queue management ──────────────────────────────────────

    pub async fn create_queue(&self, new: NewQueue) -> Result<QueueDefinition, EngineError> {
        self.registry.create(new).await
    }

    pub async fn get_queue(
        &self,
        name: &str,
        with_stats: bool,
    ) -> Result<QueueDefinition, EngineError> {
        self.registry.get(name, with_stats).await
    }

    pub async fn list_queues(&self) -> Result<Vec<QueueDefinition>, EngineError> {
        self.registry.list().await
    }

    pub async fn update_queue(
        &self,
        name: &str,
        patch: QueueConfigPatch,
    ) -> Result<QueueDefinition, EngineError> {
        self.registry.update_config(name, patch).await
    }

    pub async fn rename_queue(&self, old: &str, new: &str) -> Result<(), EngineError> {
        self.registry.rename(old, new).await
    }

    pub async fn delete_queue(&self, name: &str, force: bool) -> Result<(), EngineError> {
        self.registry.delete(name, force).await?;
        self.emit_change("delete", serde_json::json!({ "queue": name })).await;
        Ok(())
    }

    pub async fn purge_queue(
        &self,
        name: &str,
        status: Option<MessageStatus>,
    ) -> Result<u64, EngineError> {
        let removed = self.registry.purge(name, status).await?;

        self.activity.log(
            NewActivity::new("purge").with_context(serde_json::json!({
                "queue": name,
                "status": status.map(|s| s.as_str()),
                "removed": removed,
            })),
        );
        let mut ctx = DetectionContext::new(AnomalyEvent::BulkOp);
        ctx.queue_name = Some(name);
        ctx.operation = Some("delete");
        ctx.affected_count = Some(removed);
        self.anomaly.fire(ctx).await;

        Ok(removed)
    }

    // ── Administrative surface ────────────────────────────────

    pub async fn move_messages(
        &self,
        ids: &[String],
        from: &str,
        to: &str,
        opts: &MoveOptions,
    ) -> Result<u64, EngineError> {
        let moved = self.admin.move_messages(ids, from, to, opts).await?;
        self.emit_change(
            "update",
            serde_json::json!({ "from": from, "to": to, "count": moved }),
        )
        .await;
        Ok(moved)
    }

    pub async fn requeue_failed(&self, queue: Option<&str>) -> Result<u64, EngineError> {
        let count = self.admin.requeue_failed(queue).await?;
        self.emit_change("requeue", serde_json::json!({ "queue": queue, "count": count }))
            .await;
        Ok(count)
    }

    pub async fn clear_queue(&self, queue: &str) -> Result<u64, EngineError> {
        let removed = self.admin.clear(queue).await?;
        self.emit_change("delete", serde_json::json!({ "queue": queue, "removed": removed }))
            .await;
        Ok(removed)
    }

    /// Run one reaper pass on demand (tests, admin tooling); the periodic
    /// task keeps running regardless.
    pub async fn run_reaper_pass(&self) -> Result<u64, EngineError> {
        self.reaper.run_pass().await
    }

    // ── Observability surface ─────────────────────────────────

    pub async fn get_status(&self) -> Result<StatusSnapshot, EngineError> {
        let health = self.storage.health().await?;
        let mut queues = Vec::new();
        for def in self.registry.list().await? {
            queues.push(self.registry.get(&def.name, true).await?);
        }
        Ok(StatusSnapshot {
            health,
            totals: self.status_totals().await?,
            queues,
        })
    }

    pub async fn get_metrics(&self) -> Result<MetricsSnapshot, EngineError> {
        Ok(MetricsSnapshot {
            totals: self.status_totals().await?,
            reaper_last_pass: self.reaper.last_pass_reaped(),
            reaper_total: self.reaper.total_reaped(),
            activity_buffered: self.activity.buffered(),
            enqueue_buffered: self.buffer.as_ref().map(|b| b.pending()).unwrap_or(0),
            change_subscribers: self.broadcaster.subscriber_count(),
        })
    }

    async fn status_totals(&self) -> Result<StatusTotals, EngineError> {
        use sqlx::Row;
        let mut totals = StatusTotals::default();
        for table in TABLES {
            let rows = sqlx::query(&format!(
                "SELECT status, COUNT(*) AS count FROM {table} GROUP BY status"
            ))
            .fetch_all(self.storage.read_pool())
            .await
            .map_err(relay_storage::StorageError::Query)?;
            for row in rows {
                let status: String = row.try_get("status").map_err(relay_storage::StorageError::Query)?;
                let count: i64 = row.try_get("count").map_err(relay_storage::StorageError::Query)?;
                match MessageStatus::parse(&status) {
                    Some(MessageStatus::Queued) => totals.queued += count,
                    Some(MessageStatus::Processing) => totals.processing += count,
                    Some(MessageStatus::Acknowledged) => totals.acknowledged += count,
                    Some(MessageStatus::Dead) => totals.dead += count,
                    Some(MessageStatus::Archived) => totals.archived += count,
                    None => {}
                }
            }
        }
        Ok(totals)
    }

    pub async fn activity(&self, filter: &ActivityFilter) -> Result<Vec<ActivityEntry>, EngineError> {
        self.activity.query(filter).await
    }

    pub async fn anomalies(&self, limit: i64) -> Result<Vec<AnomalyRecord>, EngineError> {
        self.anomaly.recent(limit).await
    }

    pub async fn consumer_stats(
        &self,
        consumer_id: &str,
    ) -> Result<Option<ConsumerStats>, EngineError> {
        self.anomaly.stats().get(consumer_id).await
    }

    /// Detector management (enable/disable/register) lives on the anomaly
    /// engine's registry.
    pub fn anomaly_engine(&self) -> &AnomalyEngine {
        &self.anomaly
    }

    // ── Change streams ────────────────────────────────────────

    /// Subscribe to polled snapshot-diff change events.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.broadcaster.subscribe()
    }

    /// Subscribe to raw NOTIFY payloads on a database channel.
    pub fn subscribe_channel(&self, channel: &str) -> broadcast::Receiver<String> {
        self.hub.subscribe(channel)
    }

    /// Emit an immediate change notification. Observational; failures are
    /// logged and swallowed.
    async fn emit_change(&self, event_type: &str, payload: serde_json::Value) {
        let envelope = serde_json::json!({
            "type": event_type,
            "timestamp_ms": Utc::now().timestamp_millis(),
            "payload": payload,
        });
        if let Err(e) = self.storage.notify(&self.change_channel, &envelope).await {
            warn!(event = event_type, "change notify failed: {}", e);
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Stop background tasks and flush both buffers.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(buffer) = &self.buffer {
            buffer.flush_all().await;
        }
        self.activity.flush().await;
        let tasks = {
            let mut guard = self.tasks.lock().expect("task list lock");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }
        info!("relay engine stopped");
    }
}
