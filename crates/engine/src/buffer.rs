//! Coalescing enqueue buffer.
//!
//! Converts many single-enqueue requests into fewer multi-row inserts.
//! Each submission parks on a oneshot until its batch lands; flushes
//! trigger on buffer size, on age of the oldest entry, or explicitly.
//! Per queue, at most one flush is in flight; a trigger that arrives
//! mid-flight is honoured by a rerun once the current flush finishes.
//! A batch insert failure rejects every request in the batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use relay_core::types::{Message, NewMessage};

use crate::error::EngineError;
use crate::producer::Producer;

struct PendingEnqueue {
    message: NewMessage,
    priority: Option<i32>,
    done: oneshot::Sender<Result<Message, EngineError>>,
}

#[derive(Default)]
struct QueueBuffer {
    entries: Vec<PendingEnqueue>,
    first_at: Option<Instant>,
    in_flight: bool,
}

pub struct EnqueueBuffer {
    producer: Arc<Producer>,
    max_size: usize,
    max_wait: Duration,
    queues: Mutex<HashMap<String, QueueBuffer>>,
}

impl EnqueueBuffer {
    pub fn new(producer: Arc<Producer>, max_size: usize, max_wait_ms: u64) -> Self {
        Self {
            producer,
            max_size: max_size.max(1),
            max_wait: Duration::from_millis(max_wait_ms.max(1)),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Queue one enqueue request and wait for its individual result.
    pub async fn submit(
        &self,
        queue: &str,
        message: NewMessage,
        priority: Option<i32>,
    ) -> Result<Message, EngineError> {
        let (done, rx) = oneshot::channel();
        let size_triggered = {
            let mut map = self.queues.lock().expect("enqueue buffer lock");
            let buffer = map.entry(queue.to_string()).or_default();
            if buffer.first_at.is_none() {
                buffer.first_at = Some(Instant::now());
            }
            buffer.entries.push(PendingEnqueue {
                message,
                priority,
                done,
            });
            buffer.entries.len() >= self.max_size
        };
        if size_triggered {
            self.flush_queue(queue).await;
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::BatchRejected(
                "enqueue buffer dropped before flush".into(),
            )),
        }
    }

    /// Number of requests currently parked across all queues.
    pub fn pending(&self) -> usize {
        self.queues
            .lock()
            .expect("enqueue buffer lock")
            .values()
            .map(|b| b.entries.len())
            .sum()
    }

    /// Flush one queue's buffer. Single-flight: when another flush is in
    /// progress this returns immediately and the finishing flush reruns
    /// if entries accumulated meanwhile.
    pub async fn flush_queue(&self, queue: &str) {
        loop {
            let batch = {
                let mut map = self.queues.lock().expect("enqueue buffer lock");
                let Some(buffer) = map.get_mut(queue) else {
                    return;
                };
                if buffer.in_flight || buffer.entries.is_empty() {
                    return;
                }
                buffer.in_flight = true;
                buffer.first_at = None;
                std::mem::take(&mut buffer.entries)
            };

            self.run_flush(queue, batch).await;

            let rerun = {
                let mut map = self.queues.lock().expect("enqueue buffer lock");
                let Some(buffer) = map.get_mut(queue) else {
                    return;
                };
                buffer.in_flight = false;
                // Entries that piled up during the flush: rerun now if the
                // size trigger fired again; the timer catches the rest.
                !buffer.entries.is_empty() && buffer.entries.len() >= self.max_size
            };
            if !rerun {
                return;
            }
        }
    }

    /// Flush every queue. Used on shutdown.
    pub async fn flush_all(&self) {
        let names: Vec<String> = {
            let map = self.queues.lock().expect("enqueue buffer lock");
            map.keys().cloned().collect()
        };
        for name in names {
            self.flush_queue(&name).await;
        }
    }

    /// Group a batch by priority and issue one insert per group,
    /// resolving each parked request with its own row.
    async fn run_flush(&self, queue: &str, batch: Vec<PendingEnqueue>) {
        let total = batch.len();
        let mut groups: HashMap<Option<i32>, Vec<PendingEnqueue>> = HashMap::new();
        for pending in batch {
            groups.entry(pending.priority).or_default().push(pending);
        }

        for (priority, group) in groups {
            let messages: Vec<NewMessage> = group.iter().map(|p| p.message.clone()).collect();
            match self
                .producer
                .enqueue_batch(queue, messages, priority)
                .await
            {
                Ok(inserted) => {
                    for (pending, message) in group.into_iter().zip(inserted) {
                        let _ = pending.done.send(Ok(message));
                    }
                }
                Err(e) => {
                    // Reject-all: every request in the failed batch errors.
                    warn!(queue = %queue, count = group.len(), "buffered enqueue flush failed: {}", e);
                    let reason = e.to_string();
                    for pending in group {
                        let _ = pending
                            .done
                            .send(Err(EngineError::BatchRejected(reason.clone())));
                    }
                }
            }
        }
        debug!(queue = %queue, count = total, "enqueue buffer flushed");
    }

    /// Spawn the age-based flush timer.
    pub fn spawn_timer(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move {
            let tick = buffer.max_wait.min(Duration::from_millis(50)).max(Duration::from_millis(5));
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    buffer.flush_all().await;
                    return;
                }
                let due: Vec<String> = {
                    let map = buffer.queues.lock().expect("enqueue buffer lock");
                    map.iter()
                        .filter(|(_, b)| {
                            !b.in_flight
                                && !b.entries.is_empty()
                                && b.first_at
                                    .map(|t| t.elapsed() >= buffer.max_wait)
                                    .unwrap_or(false)
                        })
                        .map(|(name, _)| name.clone())
                        .collect()
                };
                for name in due {
                    buffer.flush_queue(&name).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::config::{AnomalyThresholds, EngineConfig};
    use relay_storage::Storage;

    fn lazy_buffer(max_size: usize, max_wait_ms: u64) -> Arc<EnqueueBuffer> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/relay_unused")
            .expect("lazy pool");
        let storage = Arc::new(Storage::from_pools(pool, None));
        let defaults = EngineConfig::from_env();
        let producer = Arc::new(Producer::new(
            storage.clone(),
            Arc::new(crate::registry::QueueRegistry::new(
                storage.clone(),
                defaults.clone(),
            )),
            Arc::new(crate::activity::ActivityRecorder::new(
                storage.clone(),
                false,
                500,
            )),
            Arc::new(crate::anomaly::AnomalyEngine::new(
                storage,
                AnomalyThresholds::from_env(),
            )),
            defaults,
        ));
        Arc::new(EnqueueBuffer::new(producer, max_size, max_wait_ms))
    }

    #[tokio::test]
    async fn test_submissions_accumulate_below_max_size() {
        let buffer = lazy_buffer(10, 60_000);
        let b = buffer.clone();
        let handle = tokio::spawn(async move {
            b.submit("q", NewMessage::with_payload(serde_json::json!({})), None)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(buffer.pending(), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn test_size_trigger_rejects_all_without_database() {
        // max_size 2: the second submit triggers a flush, which fails
        // against the unreachable database and must reject BOTH parked
        // requests (reject-all-on-batch-failure).
        let buffer = lazy_buffer(2, 60_000);
        let b1 = buffer.clone();
        let first = tokio::spawn(async move {
            b1.submit("q", NewMessage::with_payload(serde_json::json!({"n": 1})), None)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = buffer
            .submit("q", NewMessage::with_payload(serde_json::json!({"n": 2})), None)
            .await;
        assert!(second.is_err());
        let first = first.await.unwrap();
        assert!(first.is_err());
        assert_eq!(buffer.pending(), 0);
    }

    #[tokio::test]
    async fn test_flush_all_drains_every_queue() {
        let buffer = lazy_buffer(100, 60_000);
        for queue in ["a", "b"] {
            let b = buffer.clone();
            let q = queue.to_string();
            tokio::spawn(async move {
                let _ = b
                    .submit(&q, NewMessage::with_payload(serde_json::json!({})), None)
                    .await;
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(buffer.pending(), 2);
        buffer.flush_all().await;
        assert_eq!(buffer.pending(), 0);
    }
}
