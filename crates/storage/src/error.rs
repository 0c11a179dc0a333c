//! Storage error type.
//!
//! Wraps the driver error while keeping the server-side SQLSTATE code
//! reachable, so callers can tell a deadlock from a foreign-key violation
//! from a timeout without string matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("connect error: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query error: {0}")]
    Query(#[source] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("row decode error: {0}")]
    Decode(String),

    #[error("listener error: {0}")]
    Listener(#[source] sqlx::Error),
}

impl StorageError {
    /// The PostgreSQL SQLSTATE code of the underlying error, if any.
    pub fn sqlstate(&self) -> Option<String> {
        let source = match self {
            Self::Connect(e) | Self::Query(e) | Self::Listener(e) => e,
            _ => return None,
        };
        source
            .as_database_error()
            .and_then(|db| db.code())
            .map(|c| c.to_string())
    }

    /// Deadlock detected (40P01). The engine retries these once in
    /// best-effort paths.
    pub fn is_deadlock(&self) -> bool {
        self.sqlstate().as_deref() == Some("40P01")
    }

    /// Unique constraint violation (23505).
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate().as_deref() == Some("23505")
    }

    /// Foreign-key violation (23503).
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate().as_deref() == Some("23503")
    }

    /// Lock timeout (55P03) or statement timeout (57014).
    pub fn is_timeout(&self) -> bool {
        matches!(self.sqlstate().as_deref(), Some("55P03") | Some("57014"))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e)
    }
}
