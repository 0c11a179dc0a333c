//! Row decoding and cross-table lookup helpers.
//!
//! Messages live in one of two tables (`messages` or `messages_unlogged`)
//! depending on the owning queue's type. Operations addressed by message
//! id alone probe the standard table first, then the unlogged one.

use sqlx::postgres::PgRow;
use sqlx::Row;

use relay_core::types::{Message, MessageStatus};
use relay_storage::{Storage, StorageError};

use crate::error::EngineError;

/// Both backing tables, standard first.
pub(crate) const TABLES: [&str; 2] = ["messages", "messages_unlogged"];

/// Column list used by `RETURNING` / `SELECT` when a full row is needed.
pub(crate) const MESSAGE_COLUMNS: &str = "id, queue_name, message_type, payload, priority, \
     original_priority, status, attempt_count, max_attempts, ack_timeout_seconds, lock_token, \
     locked_until, consumer_id, created_at, dequeued_at, acknowledged_at, last_error, payload_size";

/// Decode a full message row.
pub(crate) fn message_from_row(row: &PgRow) -> Result<Message, StorageError> {
    let status_raw: String = row.try_get("status")?;
    let status = MessageStatus::parse(&status_raw)
        .ok_or_else(|| StorageError::Decode(format!("unknown message status '{status_raw}'")))?;
    Ok(Message {
        id: row.try_get("id")?,
        queue_name: row.try_get("queue_name")?,
        message_type: row.try_get("message_type")?,
        payload: row.try_get("payload")?,
        priority: row.try_get("priority")?,
        original_priority: row.try_get("original_priority")?,
        status,
        attempt_count: row.try_get("attempt_count")?,
        max_attempts: row.try_get("max_attempts")?,
        ack_timeout_seconds: row.try_get("ack_timeout_seconds")?,
        lock_token: row.try_get("lock_token")?,
        locked_until: row.try_get("locked_until")?,
        consumer_id: row.try_get("consumer_id")?,
        created_at: row.try_get("created_at")?,
        dequeued_at: row.try_get("dequeued_at")?,
        acknowledged_at: row.try_get("acknowledged_at")?,
        last_error: row.try_get("last_error")?,
        payload_size: row.try_get("payload_size")?,
    })
}

/// Locate a message by id across both backing tables. Returns the row and
/// the table it lives in.
pub(crate) async fn find_message(
    storage: &Storage,
    id: &str,
) -> Result<Option<(Message, &'static str)>, EngineError> {
    for table in TABLES {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM {table} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(storage.write_pool())
            .await
            .map_err(StorageError::Query)?;
        if let Some(row) = row {
            return Ok(Some((message_from_row(&row)?, table)));
        }
    }
    Ok(None)
}
