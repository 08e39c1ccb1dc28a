//! Process wiring: store, transport, locks, heartbeat, workers, HTTP.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{info, warn};

use forgejobs_infra::dispatch::{RedisStreamsDispatcher, RedisStreamsInbox};
use forgejobs_infra::heartbeat::RedisLocks;
use forgejobs_infra::{
    ChannelDispatcher, EngineConfig, EngineStore, Heartbeat, HeartbeatLock, InMemoryLocks, InMemoryStore,
    PostgresStore, RunDispatcher, RunExecutor, Scheduler, WorkerHandle, WorkerPool,
};
use forgejobs_observability::InMemoryMetrics;
use forgejobs_workflow::{StepRegistry, StepServices};

use crate::app::{AppState, build_app};

const POOL_MAX_CONNECTIONS: u32 = 10;
const CHANNEL_CAPACITY: usize = 1_024;

/// Run until `shutdown` flips to `true`.
pub async fn run(config: EngineConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(POOL_MAX_CONNECTIONS)
                .connect(&url)
                .await
                .context("failed to connect to Postgres")?;
            let store = PostgresStore::new(pool);
            store.migrate().await.context("failed to apply schema")?;
            serve(config, Arc::new(store), "postgres", shutdown).await
        }
        None => {
            warn!("DATABASE_URL not set; runs are kept in memory and lost on restart");
            serve(config, Arc::new(InMemoryStore::new()), "memory", shutdown).await
        }
    }
}

struct Engine {
    workers: WorkerHandle,
    heartbeat: tokio::task::JoinHandle<()>,
    transport: &'static str,
}

async fn serve<S: EngineStore>(
    config: EngineConfig,
    store: Arc<S>,
    store_backend: &'static str,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let metrics = Arc::new(InMemoryMetrics::new());

    let engine = if config.enabled {
        Some(start_engine(&config, store, Arc::clone(&metrics), shutdown.clone())?)
    } else {
        info!("custom jobs disabled; serving health endpoints only");
        None
    };

    let state = AppState {
        enabled: config.enabled,
        store_backend,
        transport: engine.as_ref().map_or("none", |e| e.transport),
        metrics,
        worker_stats: engine.as_ref().map(|e| e.workers.stats_source()),
    };
    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    let mut stop = shutdown.clone();
    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await
        .context("http server failed")?;

    if let Some(engine) = engine {
        engine.workers.shutdown().await;
        if let Err(err) = engine.heartbeat.await {
            warn!(error = %err, "heartbeat task failed");
        }
    }
    info!("shutdown complete");
    Ok(())
}

fn start_engine<S: EngineStore>(
    config: &EngineConfig,
    store: Arc<S>,
    metrics: Arc<InMemoryMetrics>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Engine> {
    // Collaborator clients (chat, search, LLM, CRM...) are wired by the embedding service.
    let runtime = Arc::new(StepRegistry::new(StepServices::default()));
    let executor = RunExecutor::new(Arc::clone(&store), runtime, metrics, config.executor_config());

    let (dispatcher, locks, workers, transport): (Arc<dyn RunDispatcher>, Arc<dyn HeartbeatLock>, WorkerHandle, _) =
        match config.redis_url.as_deref() {
            Some(url) => {
                let consumer = format!("worker-{}", std::process::id());
                let inbox = RedisStreamsInbox::new(url, None, None, consumer).context("failed to open run stream")?;
                (
                    Arc::new(RedisStreamsDispatcher::new(url, None).context("failed to open run stream")?),
                    Arc::new(RedisLocks::new(url).context("failed to open lock client")?),
                    WorkerPool::new(executor, Arc::new(inbox), config.worker_concurrency).spawn(),
                    "redis",
                )
            }
            None => {
                warn!("REDIS_URL not set; locks and run transport are process-local");
                let (dispatcher, inbox) = ChannelDispatcher::new(CHANNEL_CAPACITY);
                (
                    Arc::new(dispatcher),
                    Arc::new(InMemoryLocks::new()),
                    WorkerPool::new(executor, Arc::new(inbox), config.worker_concurrency).spawn(),
                    "channel",
                )
            }
        };

    let scheduler = Scheduler::new(store, config.tenant_id).with_claim_limit(config.claim_limit);
    let heartbeat = Heartbeat::new(scheduler, locks, dispatcher, config.heartbeat_config()).spawn(shutdown);

    info!(
        tenant_id = %config.tenant_id,
        workers = config.worker_concurrency,
        transport,
        "custom job engine started"
    );
    Ok(Engine {
        workers,
        heartbeat,
        transport,
    })
}
