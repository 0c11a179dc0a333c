//! Relay queue engine.
//!
//! Durable message brokering on top of PostgreSQL: skip-locked atomic
//! claims, fencing-token-guarded acknowledgment, bounded retry with
//! dead-letter routing, crash-safe lock recovery, and a durable
//! activity + anomaly trail. The [`Relay`] facade is the public surface;
//! transports bind to it however they like.

pub mod acker;
pub mod activity;
pub mod admin;
pub mod anomaly;
pub mod broadcast;
pub mod buffer;
pub mod dequeue;
pub mod error;
pub mod facade;
pub mod producer;
pub mod reaper;
pub mod registry;
mod rows;

pub use acker::{AckCore, NackOutcome, TouchReceipt};
pub use activity::{ActivityFilter, ActivityRecorder};
pub use admin::{AdminOps, MoveOptions};
pub use anomaly::{AnomalyDetector, AnomalyEngine, AnomalyEvent, DetectionContext};
pub use broadcast::{ChangeBroadcaster, ChangeDirection, ChangeEvent};
pub use buffer::EnqueueBuffer;
pub use dequeue::{DequeueCore, DequeueOptions};
pub use error::EngineError;
pub use facade::{MetricsSnapshot, Relay, StatusSnapshot, StatusTotals};
pub use producer::Producer;
pub use reaper::Reaper;
pub use registry::{NewQueue, QueueConfigPatch, QueueRegistry};
