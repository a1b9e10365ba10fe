use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

use demandflow_infra::queue::RedisStreamsQueue;
use demandflow_infra::store::{ensure_schema, PostgresArtifactStore, PostgresRequestStore};
use demandflow_infra::{AppConfig, Reconciler, TaskWorker, WorkerPool};
use demandflow_llm::HttpLlmClient;
use demandflow_messaging::{NotificationMessage, TaskMessage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    demandflow_observability::init();

    let config = AppConfig::from_env().context("loading configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.pool.consumers as u32 + 4)
        .connect(&config.database_url)
        .await
        .context("connecting to Postgres")?;
    ensure_schema(&pool).await.context("creating schema")?;

    let store = Arc::new(PostgresRequestStore::new(pool.clone()));
    let artifacts = Arc::new(PostgresArtifactStore::new(pool));

    let tasks = RedisStreamsQueue::<TaskMessage>::connect(
        &config.redis_url,
        config.queues.task_stream.clone(),
        config.queues.group.clone(),
    )
    .await
    .context("connecting to Redis")?
    .with_visibility_timeout(config.queues.visibility_timeout)
    .with_max_deliveries(config.queues.max_deliveries);
    tasks.ensure_group().await.context("creating consumer group")?;

    let notifications = Arc::new(
        RedisStreamsQueue::<NotificationMessage>::connect(
            &config.redis_url,
            config.queues.notification_stream.clone(),
            config.queues.group.clone(),
        )
        .await
        .context("connecting to Redis")?,
    );

    let llm = HttpLlmClient::new(
        config.providers.openai.clone(),
        config.providers.gemini.clone(),
        config.providers.request_timeout,
    )
    .context("building LLM client")?;

    let worker = Arc::new(TaskWorker::new(
        store.clone(),
        artifacts,
        notifications.clone(),
        Arc::new(llm),
        config.worker.clone(),
    ));
    let workers = WorkerPool::spawn(worker, Arc::new(tasks), config.pool.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    let reconciler = Reconciler::new(store, notifications, config.reconcile.clone());
    let reconciling = tokio::spawn(async move { reconciler.run(stop_rx).await });

    tracing::info!(
        consumers = config.pool.consumers,
        task_stream = %config.queues.task_stream,
        "demandflow worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutting down");

    let _ = stop_tx.send(true);
    workers.shutdown().await;
    reconciling.await.context("reconciler task")?;

    Ok(())
}
