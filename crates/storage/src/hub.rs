//! In-process fan-out for `LISTEN/NOTIFY` channels.
//!
//! One dedicated listener connection serves every in-process subscriber:
//! the first subscription to a channel issues the `LISTEN`, later
//! subscriptions to the same channel share it, and notifications fan out
//! through a broadcast channel per database channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::StorageError;

const FANOUT_CAPACITY: usize = 256;

/// Shared LISTEN/NOTIFY multiplexer.
pub struct ChannelHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    control: mpsc::UnboundedSender<String>,
}

impl ChannelHub {
    /// Connect the dedicated listener connection and start the receive loop.
    pub async fn start(pool: PgPool) -> Result<Self, StorageError> {
        let listener = PgListener::connect_with(&pool)
            .await
            .map_err(StorageError::Listener)?;
        let channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (control, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_listener(listener, channels.clone(), control_rx));

        Ok(Self { channels, control })
    }

    /// Subscribe to a channel. The returned receiver yields raw NOTIFY
    /// payloads; dropping it unsubscribes this consumer (the `LISTEN`
    /// itself stays active for later subscribers).
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut map = self.channels.lock().expect("channel map lock");
        if let Some(tx) = map.get(channel) {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(FANOUT_CAPACITY);
        map.insert(channel.to_string(), tx);
        // First subscriber for this channel: ask the listener task to LISTEN.
        let _ = self.control.send(channel.to_string());
        rx
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .expect("channel map lock")
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

async fn run_listener(
    mut listener: PgListener,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    mut control_rx: mpsc::UnboundedReceiver<String>,
) {
    loop {
        tokio::select! {
            cmd = control_rx.recv() => {
                match cmd {
                    Some(channel) => {
                        if let Err(e) = listener.listen(&channel).await {
                            warn!(channel = %channel, "LISTEN failed: {}", e);
                        } else {
                            debug!(channel = %channel, "listening");
                        }
                    }
                    // Hub dropped: stop the loop.
                    None => return,
                }
            }
            notification = listener.recv() => {
                match notification {
                    Ok(n) => {
                        let map = channels.lock().expect("channel map lock");
                        if let Some(tx) = map.get(n.channel()) {
                            // Send fails only when no receiver is alive; the
                            // LISTEN stays registered for future subscribers.
                            let _ = tx.send(n.payload().to_string());
                        }
                    }
                    Err(e) => {
                        // PgListener reconnects and re-issues LISTENs on its
                        // own; back off briefly and keep receiving.
                        warn!("listener receive error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    }
                }
            }
        }
    }
}
