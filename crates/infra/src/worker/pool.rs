//! Concurrent consumer loops over the task queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use demandflow_messaging::{MessageQueue, TaskMessage};

use super::task_worker::{HandleOutcome, TaskWorker};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent consumers
    pub consumers: usize,
    /// Consumer names are `{name_prefix}-{index}`
    pub name_prefix: String,
    /// How long one receive call blocks before re-checking for shutdown
    pub poll_wait: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            consumers: 4,
            name_prefix: "worker".to_string(),
            poll_wait: Duration::from_secs(1),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers.max(1);
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub received: u64,
    pub redelivered: u64,
    pub completed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub renotified: u64,
    pub unknown: u64,
    /// Deliveries left unacked because the store or broker failed.
    pub errors: u64,
}

impl PoolStats {
    fn record(&mut self, outcome: HandleOutcome) {
        match outcome {
            HandleOutcome::Completed => self.completed += 1,
            HandleOutcome::Failed(_) => self.failed += 1,
            HandleOutcome::Duplicate(_) => self.duplicates += 1,
            HandleOutcome::Renotified => self.renotified += 1,
            HandleOutcome::UnknownRequest => self.unknown += 1,
        }
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPoolHandle {
    /// Stop taking new deliveries and wait for in-progress ones to finish.
    pub async fn shutdown(self) {
        let Self {
            shutdown, joins, ..
        } = self;
        let _ = shutdown.send(true);
        for join in joins {
            if let Err(e) = join.await {
                error!(error = %e, "consumer task panicked");
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.consumers` consumer tasks on the current tokio runtime.
    pub fn spawn(
        worker: Arc<TaskWorker>,
        tasks: Arc<dyn MessageQueue<TaskMessage>>,
        config: WorkerPoolConfig,
    ) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(PoolStats::default()));

        let joins = (0..config.consumers.max(1))
            .map(|i| {
                let name = format!("{}-{}", config.name_prefix, i);
                tokio::spawn(consume(
                    name,
                    worker.clone(),
                    tasks.clone(),
                    config.poll_wait,
                    shutdown_rx.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        info!(consumers = config.consumers.max(1), "worker pool started");
        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
        }
    }
}

async fn consume(
    name: String,
    worker: Arc<TaskWorker>,
    tasks: Arc<dyn MessageQueue<TaskMessage>>,
    poll_wait: Duration,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<PoolStats>>,
) {
    debug!(consumer = %name, "consumer started");

    while !*shutdown.borrow() {
        let delivery = match tasks.receive(&name, poll_wait).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                warn!(consumer = %name, error = %e, "receive failed; backing off");
                tokio::select! {
                    _ = tokio::time::sleep(poll_wait) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        };

        {
            let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
            s.received += 1;
            if delivery.is_redelivery() {
                s.redelivered += 1;
            }
        }

        match worker.handle(&delivery.message).await {
            Ok(outcome) => {
                stats.lock().unwrap_or_else(|e| e.into_inner()).record(outcome);
                if let Err(e) = tasks.ack(&delivery.tag).await {
                    warn!(consumer = %name, tag = %delivery.tag, error = %e, "ack failed; message will be redelivered");
                }
            }
            Err(e) => {
                stats.lock().unwrap_or_else(|e| e.into_inner()).errors += 1;
                error!(
                    consumer = %name,
                    request_id = %delivery.message.request_id,
                    error = %e,
                    "task left for redelivery"
                );
                if let Err(e) = tasks.nack(&delivery.tag).await {
                    warn!(consumer = %name, tag = %delivery.tag, error = %e, "nack failed");
                }
            }
        }
    }

    debug!(consumer = %name, "consumer stopped");
}
