//! Typed access to the relational store backing the broker.
//!
//! Two pools: a bounded **write pool** used by every mutating path
//! (enqueue, dequeue, ack, reaper, buffer flushes) and an optional **read
//! pool** for dashboard reads, log browsing, and broadcaster polls, so
//! read load cannot starve the critical writes. Every connection gets a
//! session-level `statement_timeout` and `lock_timeout` so a wedged
//! statement or lock wait fails instead of hanging.

pub mod error;
pub mod hub;

pub use error::StorageError;
pub use hub::ChannelHub;

use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres, Transaction};
use std::time::Instant;
use tracing::info;

use relay_core::config::DatabaseConfig;

/// Pooled, timeout-guarded access to PostgreSQL.
#[derive(Clone)]
pub struct Storage {
    write: PgPool,
    read: Option<PgPool>,
}

impl Storage {
    /// Connect both pools and apply pending migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let url = config.connection_string();
        info!("Connecting to PostgreSQL: {}", mask_password(&url));

        let write = build_pool(config, config.write_pool_size, &url).await?;
        let read = if config.read_pool_size > 0 {
            Some(build_pool(config, config.read_pool_size, &url).await?)
        } else {
            None
        };

        let storage = Self { write, read };
        sqlx::migrate!("../../migrations")
            .run(&storage.write)
            .await?;
        info!(
            write_pool = config.write_pool_size,
            read_pool = config.read_pool_size,
            "PostgreSQL connected, schema up to date"
        );
        Ok(storage)
    }

    /// Wrap already-built pools. Used by tests that manage their own pool.
    pub fn from_pools(write: PgPool, read: Option<PgPool>) -> Self {
        Self { write, read }
    }

    /// Pool for mutating statements.
    pub fn write_pool(&self) -> &PgPool {
        &self.write
    }

    /// Pool for read-only statements; falls back to the write pool when no
    /// read pool is configured.
    pub fn read_pool(&self) -> &PgPool {
        self.read.as_ref().unwrap_or(&self.write)
    }

    /// Begin a transaction on the write pool.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, StorageError> {
        self.write.begin().await.map_err(StorageError::Query)
    }

    /// Send a NOTIFY on `channel` with a JSON payload.
    pub async fn notify(&self, channel: &str, payload: &Value) -> Result<(), StorageError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload.to_string())
            .execute(&self.write)
            .await?;
        Ok(())
    }

    /// Round-trip probe plus pool gauges.
    pub async fn health(&self) -> Result<Health, StorageError> {
        let start = Instant::now();
        sqlx::query("SELECT 1").execute(&self.write).await?;
        Ok(Health {
            reachable: true,
            latency_ms: start.elapsed().as_millis() as u64,
            write_pool_size: self.write.size(),
            write_pool_idle: self.write.num_idle(),
            read_pool_size: self.read.as_ref().map(|p| p.size()),
            read_pool_idle: self.read.as_ref().map(|p| p.num_idle()),
        })
    }
}

async fn build_pool(
    config: &DatabaseConfig,
    size: u32,
    url: &str,
) -> Result<PgPool, StorageError> {
    let statement_timeout = config.statement_timeout_ms;
    let lock_timeout = config.lock_timeout_ms;
    PgPoolOptions::new()
        .max_connections(size)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                conn.execute(format!("SET statement_timeout = {statement_timeout}").as_str())
                    .await?;
                conn.execute(format!("SET lock_timeout = {lock_timeout}").as_str())
                    .await?;
                Ok(())
            })
        })
        .connect(url)
        .await
        .map_err(StorageError::Connect)
}

/// Log-safe connection URL: password replaced, host kept.
fn mask_password(url: &str) -> String {
    match (url.find("://"), url.find('@')) {
        (Some(scheme), Some(at)) if scheme + 3 < at => {
            format!("{}***@{}", &url[..scheme + 3], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

/// Result of [`Storage::health`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct Health {
    pub reachable: bool,
    pub latency_ms: u64,
    pub write_pool_size: u32,
    pub write_pool_idle: usize,
    pub read_pool_size: Option<u32>,
    pub read_pool_idle: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_password_hides_credentials() {
        let masked = mask_password("postgres://relay:hunter2@db:5432/relay");
        assert_eq!(masked, "postgres://***@db:5432/relay");
        assert!(!masked.contains("hunter2"));
    }

    #[test]
    fn test_mask_password_passthrough_without_userinfo() {
        assert_eq!(mask_password("postgres://db/relay"), "postgres://db/relay");
    }
}
