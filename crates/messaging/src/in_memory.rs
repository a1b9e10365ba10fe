//! In-memory queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::queue::{Delivery, DeliveryTag, MessageQueue, QueueError};

#[derive(Debug, Clone)]
struct Entry<M> {
    seq: u64,
    message: M,
    delivery_count: u32,
}

#[derive(Debug)]
struct State<M> {
    next_seq: u64,
    ready: VecDeque<Entry<M>>,
    in_flight: HashMap<DeliveryTag, Entry<M>>,
    published: u64,
    acked: u64,
}

/// In-memory work queue.
///
/// - FIFO ready list, one consumer per delivery
/// - `nack` requeues at the back with an incremented delivery count
/// - [`InMemoryQueue::redeliver_in_flight`] simulates every consumer crashing
/// - [`InMemoryQueue::fail_next_publishes`] simulates a broker outage
#[derive(Debug)]
pub struct InMemoryQueue<M> {
    state: Mutex<State<M>>,
    notify: Notify,
    failing_publishes: AtomicU32,
}

impl<M> Default for InMemoryQueue<M> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                next_seq: 0,
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
                published: 0,
                acked: 0,
            }),
            notify: Notify::new(),
            failing_publishes: AtomicU32::new(0),
        }
    }
}

impl<M: Clone> InMemoryQueue<M> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State<M>> {
        // A panic while holding the lock leaves the queue structurally intact.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `n` publishes fail with a connection error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Messages waiting for a consumer, in delivery order.
    pub fn ready_messages(&self) -> Vec<M> {
        self.lock().ready.iter().map(|e| e.message.clone()).collect()
    }

    /// Remove and return every waiting message.
    pub fn drain_ready(&self) -> Vec<M> {
        self.lock().ready.drain(..).map(|e| e.message).collect()
    }

    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Total successful publishes over the queue's lifetime.
    pub fn published_count(&self) -> u64 {
        self.lock().published
    }

    pub fn acked_count(&self) -> u64 {
        self.lock().acked
    }

    /// Return every unacknowledged delivery to the ready list.
    ///
    /// Equivalent to all consumers dying mid-processing.
    pub fn redeliver_in_flight(&self) -> usize {
        let mut state = self.lock();
        let mut entries: Vec<Entry<M>> = state.in_flight.drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| e.seq);
        let n = entries.len();
        for entry in entries.into_iter().rev() {
            state.ready.push_front(entry);
        }
        drop(state);
        for _ in 0..n {
            self.notify.notify_one();
        }
        n
    }

    /// Hand out the next ready message, if any, without waiting.
    fn try_take(&self) -> Option<Delivery<M>> {
        let mut state = self.lock();
        let mut entry = state.ready.pop_front()?;
        entry.delivery_count += 1;
        let tag = DeliveryTag::new(format!("{}-{}", entry.seq, entry.delivery_count));
        let delivery = Delivery {
            tag: tag.clone(),
            message: entry.message.clone(),
            delivery_count: entry.delivery_count,
        };
        state.in_flight.insert(tag, entry);
        Some(delivery)
    }
}

#[async_trait]
impl<M> MessageQueue<M> for InMemoryQueue<M>
where
    M: Clone + Send + Sync + 'static,
{
    async fn publish(&self, message: &M) -> Result<(), QueueError> {
        let failing = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(QueueError::Connection("simulated broker outage".to_string()));
        }

        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.published += 1;
            state.ready.push_back(Entry {
                seq,
                message: message.clone(),
                delivery_count: 0,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(
        &self,
        _consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery<M>>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_take() {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(self.try_take());
            }
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        let mut state = self.lock();
        state
            .in_flight
            .remove(tag)
            .ok_or_else(|| QueueError::UnknownDelivery(tag.to_string()))?;
        state.acked += 1;
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            let entry = state
                .in_flight
                .remove(tag)
                .ok_or_else(|| QueueError::UnknownDelivery(tag.to_string()))?;
            state.ready.push_back(entry);
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let q = InMemoryQueue::<u32>::new();
        q.publish(&1).await.unwrap();
        q.publish(&2).await.unwrap();

        let a = q.receive("c1", WAIT).await.unwrap().unwrap();
        let b = q.receive("c1", WAIT).await.unwrap().unwrap();
        assert_eq!((a.message, b.message), (1, 2));
        assert_eq!(a.delivery_count, 1);
        assert_eq!(q.in_flight_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out_when_empty() {
        let q = InMemoryQueue::<u32>::new();
        assert!(q.receive("c1", WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acked_message_is_never_redelivered() {
        let q = InMemoryQueue::<u32>::new();
        q.publish(&7).await.unwrap();
        let d = q.receive("c1", WAIT).await.unwrap().unwrap();
        q.ack(&d.tag).await.unwrap();

        assert_eq!(q.redeliver_in_flight(), 0);
        assert_eq!(q.ready_len(), 0);
        assert_eq!(q.acked_count(), 1);
        assert!(matches!(q.ack(&d.tag).await, Err(QueueError::UnknownDelivery(_))));
    }

    #[tokio::test]
    async fn nack_requeues_with_higher_delivery_count() {
        let q = InMemoryQueue::<u32>::new();
        q.publish(&7).await.unwrap();
        let d = q.receive("c1", WAIT).await.unwrap().unwrap();
        q.nack(&d.tag).await.unwrap();

        let again = q.receive("c2", WAIT).await.unwrap().unwrap();
        assert_eq!(again.message, 7);
        assert_eq!(again.delivery_count, 2);
        assert!(again.is_redelivery());
    }

    #[tokio::test]
    async fn crash_redelivery_preserves_order() {
        let q = InMemoryQueue::<u32>::new();
        for i in 0..3 {
            q.publish(&i).await.unwrap();
        }
        let _ = q.receive("c1", WAIT).await.unwrap();
        let _ = q.receive("c1", WAIT).await.unwrap();

        assert_eq!(q.redeliver_in_flight(), 2);
        assert_eq!(q.ready_messages(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn simulated_outage_rejects_publishes() {
        let q = InMemoryQueue::<u32>::new();
        q.fail_next_publishes(2);
        assert!(q.publish(&1).await.unwrap_err().is_transient());
        assert!(q.publish(&1).await.is_err());
        assert!(q.publish(&1).await.is_ok());
        assert_eq!(q.published_count(), 1);
    }

    #[tokio::test]
    async fn waiting_receiver_is_woken_by_publish() {
        let q = std::sync::Arc::new(InMemoryQueue::<u32>::new());
        let rx = {
            let q = q.clone();
            tokio::spawn(async move { q.receive("c1", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        q.publish(&9).await.unwrap();

        let d = rx.await.unwrap().unwrap().unwrap();
        assert_eq!(d.message, 9);
    }
}
