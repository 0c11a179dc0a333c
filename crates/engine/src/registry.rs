//! Queue registry: CRUD over named queues plus the hot-path config cache.
//!
//! `get_config` sits on every enqueue and dequeue, so the three fields it
//! needs (type, max_attempts, ack_timeout_seconds) are cached in-process
//! with a short TTL. Full definitions carry mutable denormalized counts
//! and are never cached. Any mutation of a queue invalidates its entry.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, info};

use relay_core::config::EngineConfig;
use relay_core::types::{MessageStatus, QueueConfig, QueueDefinition, QueueType};
use relay_storage::{Storage, StorageError};

use crate::error::EngineError;

/// How long a cached queue config stays valid.
pub const CONFIG_CACHE_TTL: Duration = Duration::from_secs(60);

const CACHE_CAPACITY: usize = 1024;

/// Input for queue creation.
#[derive(Debug, Clone)]
pub struct NewQueue {
    pub name: String,
    pub queue_type: QueueType,
    pub ack_timeout_seconds: Option<i32>,
    pub max_attempts: Option<i32>,
    pub partition_interval: Option<String>,
    pub retention_interval: Option<String>,
    pub description: Option<String>,
}

impl NewQueue {
    pub fn standard(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_type: QueueType::Standard,
            ack_timeout_seconds: None,
            max_attempts: None,
            partition_interval: None,
            retention_interval: None,
            description: None,
        }
    }
}

/// Partial update for queue configuration. `None` fields are left as-is.
#[derive(Debug, Clone, Default)]
pub struct QueueConfigPatch {
    pub ack_timeout_seconds: Option<i32>,
    pub max_attempts: Option<i32>,
    pub retention_interval: Option<String>,
    pub description: Option<String>,
}

struct CachedConfig {
    config: QueueConfig,
    fetched_at: Instant,
}

pub struct QueueRegistry {
    storage: Arc<Storage>,
    defaults: EngineConfig,
    cache: Mutex<LruCache<String, CachedConfig>>,
    ttl: Duration,
}

impl QueueRegistry {
    pub fn new(storage: Arc<Storage>, defaults: EngineConfig) -> Self {
        Self {
            storage,
            defaults,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
            ttl: CONFIG_CACHE_TTL,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    // ── CRUD ──────────────────────────────────────────────────

    pub async fn create(&self, new: NewQueue) -> Result<QueueDefinition, EngineError> {
        if new.name.trim().is_empty() {
            return Err(EngineError::Validation("queue name must not be empty".into()));
        }
        let ack_timeout = new
            .ack_timeout_seconds
            .unwrap_or(self.defaults.ack_timeout_seconds);
        let max_attempts = new.max_attempts.unwrap_or(self.defaults.max_attempts);
        if ack_timeout < 1 {
            return Err(EngineError::Validation("ack_timeout_seconds must be >= 1".into()));
        }
        if max_attempts < 1 {
            return Err(EngineError::Validation("max_attempts must be >= 1".into()));
        }

        let row = sqlx::query(
            "INSERT INTO queues (name, queue_type, ack_timeout_seconds, max_attempts, \
             partition_interval, retention_interval, description) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING name, queue_type, ack_timeout_seconds, max_attempts, \
             partition_interval, retention_interval, description, created_at",
        )
        .bind(&new.name)
        .bind(new.queue_type.as_str())
        .bind(ack_timeout)
        .bind(max_attempts)
        .bind(&new.partition_interval)
        .bind(&new.retention_interval)
        .bind(&new.description)
        .fetch_one(self.storage.write_pool())
        .await
        .map_err(|e| {
            let err = StorageError::Query(e);
            if err.is_unique_violation() {
                EngineError::Validation(format!("queue '{}' already exists", new.name))
            } else {
                EngineError::Storage(err)
            }
        })?;

        info!(queue = %new.name, queue_type = %new.queue_type, "queue created");
        definition_from_row(&row).map_err(Into::into)
    }

    pub async fn list(&self) -> Result<Vec<QueueDefinition>, EngineError> {
        let rows = sqlx::query(
            "SELECT name, queue_type, ack_timeout_seconds, max_attempts, partition_interval, \
             retention_interval, description, created_at FROM queues ORDER BY name",
        )
        .fetch_all(self.storage.read_pool())
        .await
        .map_err(StorageError::Query)?;
        rows.iter()
            .map(|r| definition_from_row(r).map_err(Into::into))
            .collect()
    }

    pub async fn get(
        &self,
        name: &str,
        with_stats: bool,
    ) -> Result<QueueDefinition, EngineError> {
        let row = sqlx::query(
            "SELECT name, queue_type, ack_timeout_seconds, max_attempts, partition_interval, \
             retention_interval, description, created_at FROM queues WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(self.storage.read_pool())
        .await
        .map_err(StorageError::Query)?
        .ok_or_else(|| EngineError::QueueNotFound(name.to_string()))?;

        let mut def = definition_from_row(&row)?;
        if with_stats {
            let counts = sqlx::query(&format!(
                "SELECT COUNT(*) FILTER (WHERE status = 'queued') AS queued, \
                 COUNT(*) FILTER (WHERE status = 'processing') AS processing, \
                 COUNT(*) FILTER (WHERE status = 'dead') AS dead \
                 FROM {} WHERE queue_name = $1",
                def.queue_type.table()
            ))
            .bind(name)
            .fetch_one(self.storage.read_pool())
            .await
            .map_err(StorageError::Query)?;
            def.message_count = Some(counts.try_get("queued").map_err(StorageError::Query)?);
            def.processing_count =
                Some(counts.try_get("processing").map_err(StorageError::Query)?);
            def.dead_count = Some(counts.try_get("dead").map_err(StorageError::Query)?);
        }
        Ok(def)
    }

    pub async fn update_config(
        &self,
        name: &str,
        patch: QueueConfigPatch,
    ) -> Result<QueueDefinition, EngineError> {
        if let Some(t) = patch.ack_timeout_seconds {
            if t < 1 {
                return Err(EngineError::Validation("ack_timeout_seconds must be >= 1".into()));
            }
        }
        if let Some(m) = patch.max_attempts {
            if m < 1 {
                return Err(EngineError::Validation("max_attempts must be >= 1".into()));
            }
        }
        let row = sqlx::query(
            "UPDATE queues SET \
             ack_timeout_seconds = COALESCE($2, ack_timeout_seconds), \
             max_attempts = COALESCE($3, max_attempts), \
             retention_interval = COALESCE($4, retention_interval), \
             description = COALESCE($5, description), \
             updated_at = NOW() \
             WHERE name = $1 \
             RETURNING name, queue_type, ack_timeout_seconds, max_attempts, \
             partition_interval, retention_interval, description, created_at",
        )
        .bind(name)
        .bind(patch.ack_timeout_seconds)
        .bind(patch.max_attempts)
        .bind(&patch.retention_interval)
        .bind(&patch.description)
        .fetch_optional(self.storage.write_pool())
        .await
        .map_err(StorageError::Query)?
        .ok_or_else(|| EngineError::QueueNotFound(name.to_string()))?;

        self.invalidate(name);
        definition_from_row(&row).map_err(Into::into)
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<(), EngineError> {
        if new.trim().is_empty() {
            return Err(EngineError::Validation("queue name must not be empty".into()));
        }
        let mut tx = self.storage.begin().await?;
        let updated = sqlx::query("UPDATE queues SET name = $2, updated_at = NOW() WHERE name = $1")
            .bind(old)
            .bind(new)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Query)?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::QueueNotFound(old.to_string()));
        }
        for table in crate::rows::TABLES {
            sqlx::query(&format!(
                "UPDATE {table} SET queue_name = $2 WHERE queue_name = $1"
            ))
            .bind(old)
            .bind(new)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Query)?;
        }
        tx.commit().await.map_err(StorageError::Query)?;
        self.invalidate(old);
        self.invalidate(new);
        info!(from = %old, to = %new, "queue renamed");
        Ok(())
    }

    /// Delete a queue. Without `force`, refuses while any message in the
    /// queue is still in a non-terminal state; with `force`, drops all rows.
    pub async fn delete(&self, name: &str, force: bool) -> Result<(), EngineError> {
        let config = self.get_config(name).await?;
        let table = config.queue_type.table();

        if !force {
            let pending: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {table} \
                 WHERE queue_name = $1 AND status IN ('queued', 'processing')"
            ))
            .bind(name)
            .fetch_one(self.storage.write_pool())
            .await
            .map_err(StorageError::Query)?;
            if pending > 0 {
                return Err(EngineError::QueueNotEmpty(name.to_string()));
            }
        }

        let mut tx = self.storage.begin().await?;
        sqlx::query(&format!("DELETE FROM {table} WHERE queue_name = $1"))
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Query)?;
        sqlx::query("DELETE FROM queues WHERE name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Query)?;
        tx.commit().await.map_err(StorageError::Query)?;

        self.invalidate(name);
        info!(queue = %name, force, "queue deleted");
        Ok(())
    }

    /// Delete messages from a queue, optionally limited to one status.
    /// Returns the number of rows removed.
    pub async fn purge(
        &self,
        name: &str,
        status: Option<MessageStatus>,
    ) -> Result<u64, EngineError> {
        let config = self.get_config(name).await?;
        let table = config.queue_type.table();
        let result = match status {
            Some(s) => sqlx::query(&format!(
                "DELETE FROM {table} WHERE queue_name = $1 AND status = $2"
            ))
            .bind(name)
            .bind(s.as_str())
            .execute(self.storage.write_pool())
            .await,
            None => sqlx::query(&format!("DELETE FROM {table} WHERE queue_name = $1"))
                .bind(name)
                .execute(self.storage.write_pool())
                .await,
        }
        .map_err(StorageError::Query)?;
        Ok(result.rows_affected())
    }

    // ── Hot path ──────────────────────────────────────────────

    /// The per-enqueue/per-dequeue config lookup. TTL-cached.
    pub async fn get_config(&self, name: &str) -> Result<QueueConfig, EngineError> {
        {
            let mut cache = self.cache.lock().expect("config cache lock");
            if let Some(entry) = cache.get(name) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.config);
                }
            }
        }

        let row = sqlx::query(
            "SELECT queue_type, max_attempts, ack_timeout_seconds FROM queues WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(self.storage.write_pool())
        .await
        .map_err(StorageError::Query)?
        .ok_or_else(|| EngineError::QueueNotFound(name.to_string()))?;
        let config = config_from_row(&row)?;

        let mut cache = self.cache.lock().expect("config cache lock");
        cache.put(
            name.to_string(),
            CachedConfig {
                config,
                fetched_at: Instant::now(),
            },
        );
        debug!(queue = %name, "queue config cached");
        Ok(config)
    }

    pub fn invalidate(&self, name: &str) {
        self.cache.lock().expect("config cache lock").pop(name);
    }

    #[cfg(test)]
    pub(crate) fn cache_contains(&self, name: &str) -> bool {
        self.cache.lock().expect("config cache lock").contains(name)
    }
}

fn queue_type_from_str(s: &str) -> Result<QueueType, StorageError> {
    QueueType::parse(s).ok_or_else(|| StorageError::Decode(format!("unknown queue type '{s}'")))
}

fn config_from_row(row: &PgRow) -> Result<QueueConfig, StorageError> {
    let type_raw: String = row.try_get("queue_type")?;
    Ok(QueueConfig {
        queue_type: queue_type_from_str(&type_raw)?,
        max_attempts: row.try_get("max_attempts")?,
        ack_timeout_seconds: row.try_get("ack_timeout_seconds")?,
    })
}

fn definition_from_row(row: &PgRow) -> Result<QueueDefinition, StorageError> {
    let type_raw: String = row.try_get("queue_type")?;
    Ok(QueueDefinition {
        name: row.try_get("name")?,
        queue_type: queue_type_from_str(&type_raw)?,
        ack_timeout_seconds: row.try_get("ack_timeout_seconds")?,
        max_attempts: row.try_get("max_attempts")?,
        partition_interval: row.try_get("partition_interval")?,
        retention_interval: row.try_get("retention_interval")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        message_count: None,
        processing_count: None,
        dead_count: None,
    })
}
