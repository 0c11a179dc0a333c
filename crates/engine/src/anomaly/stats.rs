//! Per-consumer statistics.
//!
//! Counters are upserted into `consumer_stats` on every claim/ack/failure
//! (best-effort, one retry on deadlock). The bounded recent-dequeue
//! window lives in memory and is mirrored into the row as JSONB; it feeds
//! burst detection, which also dedups here so one burst produces one
//! anomaly per window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use tracing::warn;

use relay_core::types::ConsumerStats;
use relay_storage::{Storage, StorageError};

use crate::error::EngineError;

/// Recent-dequeue window length per consumer.
const RING_CAPACITY: usize = 100;

pub struct ConsumerTracker {
    storage: Arc<Storage>,
    window: Duration,
    rings: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    last_burst: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ConsumerTracker {
    pub fn new(storage: Arc<Storage>, window_seconds: i64) -> Self {
        Self {
            storage,
            window: Duration::seconds(window_seconds.max(1)),
            rings: Mutex::new(HashMap::new()),
            last_burst: Mutex::new(HashMap::new()),
        }
    }

    /// Record a claim: push into the ring, bump the counter row, and
    /// return how many claims landed inside the burst window.
    pub async fn record_dequeue(&self, consumer_id: &str) -> usize {
        let now = Utc::now();
        let (count_in_window, ring_snapshot) = {
            let mut rings = self.rings.lock().expect("consumer ring lock");
            let ring = rings.entry(consumer_id.to_string()).or_default();
            ring.push_back(now);
            while ring.len() > RING_CAPACITY {
                ring.pop_front();
            }
            let cutoff = now - self.window;
            let count = ring.iter().filter(|t| **t >= cutoff).count();
            (count, ring.iter().copied().collect::<Vec<_>>())
        };

        let recent = serde_json::to_value(&ring_snapshot).unwrap_or(serde_json::Value::Null);
        self.upsert(
            consumer_id,
            "INSERT INTO consumer_stats (consumer_id, dequeued, last_dequeue_at, recent_dequeues) \
             VALUES ($1, 1, NOW(), $2) \
             ON CONFLICT (consumer_id) DO UPDATE SET \
             dequeued = consumer_stats.dequeued + 1, last_dequeue_at = NOW(), \
             recent_dequeues = EXCLUDED.recent_dequeues",
            Some(recent),
        )
        .await;

        count_in_window
    }

    /// Record a successful acknowledgment.
    pub async fn record_ack(&self, consumer_id: &str) {
        self.upsert(
            consumer_id,
            "INSERT INTO consumer_stats (consumer_id, acknowledged, last_ack_at) \
             VALUES ($1, 1, NOW()) \
             ON CONFLICT (consumer_id) DO UPDATE SET \
             acknowledged = consumer_stats.acknowledged + 1, last_ack_at = NOW()",
            None,
        )
        .await;
    }

    /// Record a nack/failure.
    pub async fn record_failure(&self, consumer_id: &str) {
        self.upsert(
            consumer_id,
            "INSERT INTO consumer_stats (consumer_id, failed) VALUES ($1, 1) \
             ON CONFLICT (consumer_id) DO UPDATE SET failed = consumer_stats.failed + 1",
            None,
        )
        .await;
    }

    /// Burst dedup: true when no burst anomaly was recorded for this
    /// consumer within the current window.
    pub fn note_burst(&self, consumer_id: &str) -> bool {
        let now = Utc::now();
        let mut last = self.last_burst.lock().expect("burst dedup lock");
        match last.get(consumer_id) {
            Some(at) if now - *at < self.window => false,
            _ => {
                last.insert(consumer_id.to_string(), now);
                true
            }
        }
    }

    /// Claims currently inside the window, without recording anything.
    pub fn window_count(&self, consumer_id: &str) -> usize {
        let cutoff = Utc::now() - self.window;
        self.rings
            .lock()
            .expect("consumer ring lock")
            .get(consumer_id)
            .map(|ring| ring.iter().filter(|t| **t >= cutoff).count())
            .unwrap_or(0)
    }

    /// Read a consumer's persisted stats row.
    pub async fn get(&self, consumer_id: &str) -> Result<Option<ConsumerStats>, EngineError> {
        let row = sqlx::query(
            "SELECT consumer_id, dequeued, acknowledged, failed, last_dequeue_at, last_ack_at, \
             recent_dequeues FROM consumer_stats WHERE consumer_id = $1",
        )
        .bind(consumer_id)
        .fetch_optional(self.storage.read_pool())
        .await
        .map_err(StorageError::Query)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let recent_raw: serde_json::Value =
            row.try_get("recent_dequeues").map_err(StorageError::Query)?;
        Ok(Some(ConsumerStats {
            consumer_id: row.try_get("consumer_id").map_err(StorageError::Query)?,
            dequeued: row.try_get("dequeued").map_err(StorageError::Query)?,
            acknowledged: row.try_get("acknowledged").map_err(StorageError::Query)?,
            failed: row.try_get("failed").map_err(StorageError::Query)?,
            last_dequeue_at: row.try_get("last_dequeue_at").map_err(StorageError::Query)?,
            last_ack_at: row.try_get("last_ack_at").map_err(StorageError::Query)?,
            recent_dequeues: serde_json::from_value(recent_raw).unwrap_or_default(),
        }))
    }

    /// Best-effort counter upsert with one deadlock retry.
    async fn upsert(&self, consumer_id: &str, sql: &str, json_arg: Option<serde_json::Value>) {
        match self.try_upsert(consumer_id, sql, json_arg.as_ref()).await {
            Ok(_) => {}
            Err(e) if e.is_deadlock() => {
                if let Err(e) = self.try_upsert(consumer_id, sql, json_arg.as_ref()).await {
                    warn!(consumer = %consumer_id, "stats upsert failed after retry: {}", e);
                }
            }
            Err(e) => warn!(consumer = %consumer_id, "stats upsert failed: {}", e),
        }
    }

    async fn try_upsert(
        &self,
        consumer_id: &str,
        sql: &str,
        json_arg: Option<&serde_json::Value>,
    ) -> Result<(), StorageError> {
        let mut query = sqlx::query(sql).bind(consumer_id);
        if let Some(v) = json_arg {
            query = query.bind(v);
        }
        query
            .execute(self.storage.write_pool())
            .await
            .map_err(StorageError::Query)?;
        Ok(())
    }
}
