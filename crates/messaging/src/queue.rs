//! Durable queue abstraction (mechanics only).
//!
//! A queue hands each published message to one consumer at a time. The
//! consumer either **acks** it (done, never delivered again) or **nacks** it
//! (make it available for redelivery). A message that is neither acked nor
//! nacked is redelivered once the backend decides its consumer is gone.
//!
//! Implementations: [`crate::InMemoryQueue`] for tests/dev, and the Redis
//! Streams queue in `demandflow-infra`.

use std::time::Duration;

use async_trait::async_trait;

/// Opaque handle identifying one delivery of one message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer, awaiting ack/nack.
#[derive(Debug, Clone)]
pub struct Delivery<M> {
    pub tag: DeliveryTag,
    pub message: M,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

impl<M> Delivery<M> {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("message serialization error: {0}")]
    Serialization(String),

    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(String),
}

impl QueueError {
    /// Connection and command failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Connection(_) | QueueError::Command(_))
    }
}

#[async_trait]
pub trait MessageQueue<M>: Send + Sync
where
    M: Send + 'static,
{
    /// Publish a message. Returns once the backend has accepted it.
    async fn publish(&self, message: &M) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next message for `consumer`.
    async fn receive(&self, consumer: &str, wait: Duration)
        -> Result<Option<Delivery<M>>, QueueError>;

    /// Acknowledge a delivery. It will not be delivered again.
    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError>;

    /// Give a delivery back for redelivery.
    async fn nack(&self, tag: &DeliveryTag) -> Result<(), QueueError>;
}
