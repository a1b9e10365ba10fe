//! `demandflow-messaging`
//!
//! Queue mechanics plus the two message schemas that cross process
//! boundaries: task messages (dispatcher → worker) and notification messages
//! (worker → downstream consumers).
//!
//! Delivery is **at-least-once**. Consumers must be idempotent; the request
//! store's conditional transition is what turns redelivery into a no-op.

pub mod in_memory;
pub mod message;
pub mod queue;

pub use in_memory::InMemoryQueue;
pub use message::{NotificationMessage, Outcome, TaskMessage};
pub use queue::{Delivery, DeliveryTag, MessageQueue, QueueError};
