//! Shared types, configuration, identifiers, and failure codes for the
//! Relay broker engine.

pub mod config;
pub mod error;
pub mod id;
pub mod types;

pub use config::RelayConfig;
pub use error::FailureCode;
pub use types::{
    ActivityEntry, AnomalyRecord, Claim, ConsumerStats, Message, MessageStatus, NewActivity,
    NewAnomaly, NewMessage, QueueConfig, QueueDefinition, QueueType, Severity,
};
