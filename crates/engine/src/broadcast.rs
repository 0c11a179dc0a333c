//! Change broadcaster: poll-based snapshot diffing.
//!
//! Triggers into the application are not available in every deployment,
//! so this subsystem polls recent rows on a timer, diffs against the
//! previous snapshot keyed by `queue:status`, and fans typed add/remove
//! events out to in-process subscribers. The first pass after startup is
//! silent (state building only); a re-entry guard prevents overlapping
//! polls; the loop runs only while at least one subscriber exists.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use relay_core::types::MessageStatus;
use relay_storage::{Storage, StorageError};

use crate::error::EngineError;

/// How far back the poll query looks.
const POLL_WINDOW_MINUTES: i64 = 5;
/// Row cap per poll.
const POLL_LIMIT: i64 = 500;
const FANOUT_CAPACITY: usize = 256;

/// Direction of an observed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDirection {
    Added,
    Removed,
}

/// Compact row summary carried on add events.
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    pub id: String,
    pub message_type: Option<String>,
    pub priority: i32,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
}

/// One observed (queue, status, direction) delta.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    /// Mapped event name (enqueue, dequeue, acknowledge, …).
    pub event_type: &'static str,
    pub timestamp_ms: i64,
    pub queue_name: String,
    pub status: MessageStatus,
    pub direction: ChangeDirection,
    pub count: usize,
    pub ids: Vec<String>,
    /// Summaries for added rows; empty on removals.
    pub messages: Vec<MessageSummary>,
}

fn added_event_name(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Queued => "enqueue",
        MessageStatus::Processing => "dequeue",
        MessageStatus::Acknowledged => "acknowledge",
        MessageStatus::Dead => "move_to_dlq",
        MessageStatus::Archived => "archive",
    }
}

fn removed_event_name(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Queued => "dequeue",
        MessageStatus::Processing => "processed",
        MessageStatus::Acknowledged => "delete",
        MessageStatus::Dead => "requeue",
        MessageStatus::Archived => "delete",
    }
}

type SnapKey = (String, MessageStatus);

#[derive(Default)]
struct Snapshot {
    keys: HashMap<SnapKey, HashSet<String>>,
    rows: HashMap<String, MessageSummary>,
}

struct BroadcastState {
    snapshot: Option<Snapshot>,
    task: Option<tokio::task::JoinHandle<()>>,
}

pub struct ChangeBroadcaster {
    storage: Arc<Storage>,
    poll_interval: Duration,
    tx: broadcast::Sender<ChangeEvent>,
    state: Mutex<BroadcastState>,
    polling: AtomicBool,
}

impl ChangeBroadcaster {
    pub fn new(storage: Arc<Storage>, poll_interval_ms: u64) -> Self {
        let (tx, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            storage,
            poll_interval: Duration::from_millis(poll_interval_ms.max(50)),
            tx,
            state: Mutex::new(BroadcastState {
                snapshot: None,
                task: None,
            }),
            polling: AtomicBool::new(false),
        }
    }

    /// Subscribe to change events. The first subscription starts the
    /// shared poll loop; when the last receiver is dropped the loop stops
    /// and the snapshot is cleared.
    pub fn subscribe(self: &Arc<Self>) -> broadcast::Receiver<ChangeEvent> {
        let rx = self.tx.subscribe();
        let mut state = self.state.lock().expect("broadcaster state lock");
        if state.task.is_none() {
            let this = self.clone();
            state.task = Some(tokio::spawn(async move { this.run_loop().await }));
            debug!("change broadcaster loop started");
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    async fn run_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.tx.receiver_count() == 0 {
                let mut state = self.state.lock().expect("broadcaster state lock");
                state.snapshot = None;
                state.task = None;
                debug!("last subscriber gone; change broadcaster loop stopped");
                return;
            }
            if let Err(e) = self.poll_once().await {
                warn!("change poll failed: {}", e);
            }
        }
    }

    /// One poll/diff cycle. Emits nothing on the first pass. Returns the
    /// emitted events (also pushed to subscribers).
    pub async fn poll_once(&self) -> Result<Vec<ChangeEvent>, EngineError> {
        if self.polling.swap(true, Ordering::SeqCst) {
            // A previous poll is still running; skip this tick.
            return Ok(Vec::new());
        }
        let result = self.poll_inner().await;
        self.polling.store(false, Ordering::SeqCst);
        result
    }

    async fn poll_inner(&self) -> Result<Vec<ChangeEvent>, EngineError> {
        let current = self.query_snapshot().await?;
        let events = {
            let mut state = self.state.lock().expect("broadcaster state lock");
            let previous = state.snapshot.replace(current);
            match previous {
                // First pass: state building only.
                None => Vec::new(),
                Some(previous) => {
                    let current = state.snapshot.as_ref().expect("snapshot just stored");
                    diff(&previous, current)
                }
            }
        };
        for event in &events {
            let _ = self.tx.send(event.clone());
        }
        Ok(events)
    }

    async fn query_snapshot(&self) -> Result<Snapshot, EngineError> {
        let sql = format!(
            "SELECT id, queue_name, message_type, priority, status, created_at, attempt_count \
             FROM ( \
                 SELECT id, queue_name, message_type, priority, status, created_at, attempt_count \
                 FROM messages WHERE created_at > NOW() - INTERVAL '{POLL_WINDOW_MINUTES} minutes' \
                 UNION ALL \
                 SELECT id, queue_name, message_type, priority, status, created_at, attempt_count \
                 FROM messages_unlogged \
                 WHERE created_at > NOW() - INTERVAL '{POLL_WINDOW_MINUTES} minutes' \
             ) recent \
             ORDER BY created_at DESC LIMIT {POLL_LIMIT}"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(self.storage.read_pool())
            .await
            .map_err(StorageError::Query)?;

        let mut snapshot = Snapshot::default();
        for row in &rows {
            let id: String = row.try_get("id").map_err(StorageError::Query)?;
            let queue_name: String = row.try_get("queue_name").map_err(StorageError::Query)?;
            let status_raw: String = row.try_get("status").map_err(StorageError::Query)?;
            let Some(status) = MessageStatus::parse(&status_raw) else {
                continue;
            };
            let summary = MessageSummary {
                id: id.clone(),
                message_type: row.try_get("message_type").map_err(StorageError::Query)?,
                priority: row.try_get("priority").map_err(StorageError::Query)?,
                attempt_count: row.try_get("attempt_count").map_err(StorageError::Query)?,
                created_at: row.try_get("created_at").map_err(StorageError::Query)?,
            };
            snapshot
                .keys
                .entry((queue_name, status))
                .or_default()
                .insert(id.clone());
            snapshot.rows.insert(id, summary);
        }
        Ok(snapshot)
    }
}

/// Compare snapshots: one event per (key, direction) with any changes.
fn diff(previous: &Snapshot, current: &Snapshot) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    let timestamp_ms = Utc::now().timestamp_millis();

    for (key, ids) in &current.keys {
        let before = previous.keys.get(key);
        let added: Vec<String> = ids
            .iter()
            .filter(|id| before.map(|b| !b.contains(*id)).unwrap_or(true))
            .cloned()
            .collect();
        if added.is_empty() {
            continue;
        }
        let messages = added
            .iter()
            .filter_map(|id| current.rows.get(id).cloned())
            .collect();
        events.push(ChangeEvent {
            event_type: added_event_name(key.1),
            timestamp_ms,
            queue_name: key.0.clone(),
            status: key.1,
            direction: ChangeDirection::Added,
            count: added.len(),
            ids: added,
            messages,
        });
    }

    for (key, ids) in &previous.keys {
        let now = current.keys.get(key);
        let removed: Vec<String> = ids
            .iter()
            .filter(|id| now.map(|n| !n.contains(*id)).unwrap_or(true))
            .cloned()
            .collect();
        if removed.is_empty() {
            continue;
        }
        events.push(ChangeEvent {
            event_type: removed_event_name(key.1),
            timestamp_ms,
            queue_name: key.0.clone(),
            status: key.1,
            direction: ChangeDirection::Removed,
            count: removed.len(),
            ids: removed,
            messages: Vec::new(),
        });
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str) -> MessageSummary {
        MessageSummary {
            id: id.to_string(),
            message_type: None,
            priority: 0,
            attempt_count: 0,
            created_at: Utc::now(),
        }
    }

    fn snapshot(entries: &[(&str, MessageStatus, &[&str])]) -> Snapshot {
        let mut snap = Snapshot::default();
        for (queue, status, ids) in entries {
            for id in *ids {
                snap.keys
                    .entry((queue.to_string(), *status))
                    .or_default()
                    .insert(id.to_string());
                snap.rows.insert(id.to_string(), summary(id));
            }
        }
        snap
    }

    #[test]
    fn test_diff_detects_adds() {
        let before = snapshot(&[("q", MessageStatus::Queued, &["a"])]);
        let after = snapshot(&[("q", MessageStatus::Queued, &["a", "b"])]);
        let events = diff(&before, &after);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "enqueue");
        assert_eq!(events[0].direction, ChangeDirection::Added);
        assert_eq!(events[0].ids, vec!["b".to_string()]);
        assert_eq!(events[0].messages.len(), 1);
    }

    #[test]
    fn test_diff_detects_removals() {
        let before = snapshot(&[("q", MessageStatus::Queued, &["a", "b"])]);
        let after = snapshot(&[("q", MessageStatus::Queued, &["a"])]);
        let events = diff(&before, &after);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "dequeue");
        assert_eq!(events[0].direction, ChangeDirection::Removed);
        assert_eq!(events[0].ids, vec!["b".to_string()]);
        assert!(events[0].messages.is_empty());
    }

    #[test]
    fn test_diff_tracks_status_transition_as_two_events() {
        // A row moving queued → processing leaves one key and joins
        // another: one remove plus one add.
        let before = snapshot(&[("q", MessageStatus::Queued, &["a"])]);
        let after = snapshot(&[("q", MessageStatus::Processing, &["a"])]);
        let mut events = diff(&before, &after);
        events.sort_by_key(|e| e.direction == ChangeDirection::Removed);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "dequeue");
        assert_eq!(events[0].direction, ChangeDirection::Added);
        assert_eq!(events[1].event_type, "dequeue");
        assert_eq!(events[1].direction, ChangeDirection::Removed);
    }

    #[test]
    fn test_diff_identical_snapshots_is_silent() {
        let before = snapshot(&[
            ("q", MessageStatus::Queued, &["a"]),
            ("q", MessageStatus::Dead, &["b"]),
        ]);
        let after = snapshot(&[
            ("q", MessageStatus::Queued, &["a"]),
            ("q", MessageStatus::Dead, &["b"]),
        ]);
        assert!(diff(&before, &after).is_empty());
    }

    #[test]
    fn test_event_name_mapping() {
        assert_eq!(added_event_name(MessageStatus::Queued), "enqueue");
        assert_eq!(added_event_name(MessageStatus::Processing), "dequeue");
        assert_eq!(added_event_name(MessageStatus::Acknowledged), "acknowledge");
        assert_eq!(added_event_name(MessageStatus::Dead), "move_to_dlq");
        assert_eq!(added_event_name(MessageStatus::Archived), "archive");
        assert_eq!(removed_event_name(MessageStatus::Dead), "requeue");
    }
}
