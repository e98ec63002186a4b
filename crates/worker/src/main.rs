//! `relay-worker` binary: wires the production adapters and runs the
//! selected consumer until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_broker::Broker;
use relay_infra::{JobRepository, LockStore, PostgresJobRepository, RedisLockStore, RedisStreamsBroker};
use relay_worker::{
    BrokerRequeue, Consumer, ConsumerMode, JobProcessor, LockManager, PollingConsumer,
    PollingRequeue, Requeue, RetryScheduler, WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::parse();
    relay_observability::init_with(config.log_format);
    config.validate().context("invalid configuration")?;

    let consumer_name = config.consumer_name();
    info!(
        consumer = %consumer_name,
        mode = ?config.mode,
        executor = ?config.executor,
        lock_ttl_ms = config.lock_ttl.as_millis() as u64,
        use_watchdog = config.use_watchdog,
        "starting relay worker"
    );

    let postgres = PostgresJobRepository::connect(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to postgres")?;
    postgres.migrate().await.context("failed to apply migrations")?;
    let repo: Arc<dyn JobRepository> = Arc::new(postgres);

    let lock_store: Arc<dyn LockStore> = Arc::new(
        RedisLockStore::connect(&config.redis_url)
            .await
            .context("failed to connect to redis lock store")?,
    );
    let locks = LockManager::new(lock_store, consumer_name.clone());
    let backend = config.executor.build();

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let scheduler = match config.mode {
        ConsumerMode::Broker => {
            let broker: Arc<dyn Broker> = Arc::new(
                RedisStreamsBroker::connect(
                    &config.redis_url,
                    config.stream_key.clone(),
                    config.consumer_group.clone(),
                    consumer_name.clone(),
                )
                .await
                .context("failed to connect to redis stream")?
                .with_read_block(config.read_block),
            );
            let requeue: Arc<dyn Requeue> = Arc::new(BrokerRequeue::new(broker.clone()));
            let scheduler = Arc::new(RetryScheduler::new(repo.clone(), requeue, shutdown.clone()));
            let processor = Arc::new(JobProcessor::new(
                repo.clone(),
                locks,
                backend,
                scheduler.clone(),
                config.processor_config(),
                shutdown.clone(),
            ));

            Consumer::new(broker, processor)
                .with_read_error_backoff(config.read_error_backoff)
                .run(shutdown.clone())
                .await;
            scheduler
        }
        ConsumerMode::Polling => {
            let requeue = PollingRequeue::new();
            let scheduler = Arc::new(RetryScheduler::new(
                repo.clone(),
                Arc::new(requeue.clone()),
                shutdown.clone(),
            ));
            let processor = Arc::new(JobProcessor::new(
                repo.clone(),
                locks,
                backend,
                scheduler.clone(),
                config.processor_config(),
                shutdown.clone(),
            ));

            PollingConsumer::new(repo.clone(), processor, requeue, config.poll_interval)
                .run(shutdown.clone())
                .await;
            scheduler
        }
    };

    // The consumer only returns on its own if the broker closed.
    shutdown.cancel();
    let abandoned = scheduler.pending_requeues();
    if abandoned > 0 {
        warn!(abandoned, "abandoning pending retry requeues");
    }
    scheduler.drain().await;

    info!("relay worker stopped");
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received SIGINT, shutting down");
    }

    shutdown.cancel();
}
