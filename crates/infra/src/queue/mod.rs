//! Broker-backed queue implementations.
//!
//! The in-memory queue lives in `demandflow-messaging`; this module holds the
//! Redis Streams backend (behind the `redis` feature) and its settings.

use std::time::Duration;

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;

/// Stream and consumer-group settings shared by both queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub task_stream: String,
    pub notification_stream: String,
    /// Consumer group reading the task stream
    pub group: String,
    /// Idle time after which an unacked delivery is handed to another consumer
    pub visibility_timeout: Duration,
    /// Deliveries after which a message is moved to the dead-letter stream
    pub max_deliveries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            task_stream: "demandflow:tasks".to_string(),
            notification_stream: "demandflow:notifications".to_string(),
            group: "demandflow.workers".to_string(),
            visibility_timeout: Duration::from_millis(300_000),
            max_deliveries: 10,
        }
    }
}

impl QueueSettings {
    /// Dead-letter stream name for `stream`.
    pub fn dead_letter_stream(stream: &str) -> String {
        format!("{stream}:dlq")
    }
}
