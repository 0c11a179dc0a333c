//! Buffered append-only activity log.
//!
//! Single entries accumulate in memory and are written as one multi-row
//! insert when the buffer fills or the flush timer fires. Recording is
//! observational: a failed flush is logged and dropped, never surfaced
//! into the calling path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row};
use tracing::{debug, warn};

use relay_core::types::{ActivityEntry, NewActivity};
use relay_storage::{Storage, StorageError};

use crate::error::EngineError;

pub struct ActivityRecorder {
    storage: Arc<Storage>,
    enabled: bool,
    max_size: usize,
    buffer: Mutex<Vec<NewActivity>>,
}

/// Filters for the paginated read side.
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub queue_name: Option<String>,
    pub action: Option<String>,
    pub message_id: Option<String>,
    pub consumer_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ActivityRecorder {
    pub fn new(storage: Arc<Storage>, enabled: bool, max_size: usize) -> Self {
        Self {
            storage,
            enabled,
            max_size: max_size.max(1),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Append one entry. Triggers an async flush when the buffer is full.
    pub fn log(&self, entry: NewActivity) {
        if !self.enabled {
            return;
        }
        let overflow = {
            let mut buf = self.buffer.lock().expect("activity buffer lock");
            buf.push(entry);
            if buf.len() >= self.max_size {
                Some(std::mem::take(&mut *buf))
            } else {
                None
            }
        };
        if let Some(batch) = overflow {
            let storage = self.storage.clone();
            tokio::spawn(async move {
                insert_batch(&storage, batch).await;
            });
        }
    }

    /// Append many entries at once (reaper passes, bulk operations).
    pub fn log_batch(&self, entries: Vec<NewActivity>) {
        if !self.enabled || entries.is_empty() {
            return;
        }
        let overflow = {
            let mut buf = self.buffer.lock().expect("activity buffer lock");
            buf.extend(entries);
            if buf.len() >= self.max_size {
                Some(std::mem::take(&mut *buf))
            } else {
                None
            }
        };
        if let Some(batch) = overflow {
            let storage = self.storage.clone();
            tokio::spawn(async move {
                insert_batch(&storage, batch).await;
            });
        }
    }

    /// Write out everything currently buffered. Called by the flush timer
    /// and on shutdown.
    pub async fn flush(&self) {
        let batch = {
            let mut buf = self.buffer.lock().expect("activity buffer lock");
            std::mem::take(&mut *buf)
        };
        if !batch.is_empty() {
            insert_batch(&self.storage, batch).await;
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().expect("activity buffer lock").len()
    }

    /// Spawn the periodic flush task.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        flush_interval_ms: u64,
        shutdown: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let recorder = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                flush_interval_ms.max(10),
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                recorder.flush().await;
                if shutdown.load(Ordering::Relaxed) {
                    // Final flush already ran this tick.
                    return;
                }
            }
        })
    }

    /// Paginated, filterable history read.
    pub async fn query(&self, filter: &ActivityFilter) -> Result<Vec<ActivityEntry>, EngineError> {
        let mut qb = QueryBuilder::new(
            "SELECT id, action, message_id, message_type, consumer_id, queue_name, payload_size, \
             processing_time_ms, attempt_count, context, created_at FROM activity_logs WHERE 1=1",
        );
        if let Some(queue) = &filter.queue_name {
            qb.push(" AND queue_name = ").push_bind(queue);
        }
        if let Some(action) = &filter.action {
            qb.push(" AND action = ").push_bind(action);
        }
        if let Some(id) = &filter.message_id {
            qb.push(" AND message_id = ").push_bind(id);
        }
        if let Some(consumer) = &filter.consumer_id {
            qb.push(" AND consumer_id = ").push_bind(consumer);
        }
        if let Some(from) = filter.from {
            qb.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            qb.push(" AND created_at <= ").push_bind(to);
        }
        qb.push(" ORDER BY id DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(100).clamp(1, 1000))
            .push(" OFFSET ")
            .push_bind(filter.offset.unwrap_or(0).max(0));

        let rows = qb
            .build()
            .fetch_all(self.storage.read_pool())
            .await
            .map_err(StorageError::Query)?;
        rows.iter()
            .map(|row| -> Result<ActivityEntry, EngineError> {
                Ok(ActivityEntry {
                    id: row.try_get("id").map_err(StorageError::Query)?,
                    action: row.try_get("action").map_err(StorageError::Query)?,
                    message_id: row.try_get("message_id").map_err(StorageError::Query)?,
                    message_type: row.try_get("message_type").map_err(StorageError::Query)?,
                    consumer_id: row.try_get("consumer_id").map_err(StorageError::Query)?,
                    queue_name: row.try_get("queue_name").map_err(StorageError::Query)?,
                    payload_size: row.try_get("payload_size").map_err(StorageError::Query)?,
                    processing_time_ms: row
                        .try_get("processing_time_ms")
                        .map_err(StorageError::Query)?,
                    attempt_count: row.try_get("attempt_count").map_err(StorageError::Query)?,
                    context: row.try_get("context").map_err(StorageError::Query)?,
                    created_at: row.try_get("created_at").map_err(StorageError::Query)?,
                })
            })
            .collect()
    }
}

/// One multi-row insert; failures are logged and the batch is dropped.
async fn insert_batch(storage: &Storage, batch: Vec<NewActivity>) {
    let count = batch.len();
    let mut qb = QueryBuilder::new(
        "INSERT INTO activity_logs (action, message_id, message_type, consumer_id, queue_name, \
         payload_size, processing_time_ms, attempt_count, context) ",
    );
    qb.push_values(&batch, |mut b, entry| {
        b.push_bind(&entry.action)
            .push_bind(&entry.message_id)
            .push_bind(&entry.message_type)
            .push_bind(&entry.consumer_id)
            .push_bind(&entry.queue_name)
            .push_bind(entry.payload_size)
            .push_bind(entry.processing_time_ms)
            .push_bind(entry.attempt_count)
            .push_bind(&entry.context);
    });
    match qb.build().execute(storage.write_pool()).await {
        Ok(_) => debug!(count, "activity batch flushed"),
        Err(e) => warn!(count, "activity flush failed, dropping batch: {}", e),
    }
}
