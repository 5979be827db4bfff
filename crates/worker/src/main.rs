use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use innsync_infra::channel::AdapterRegistry;
use innsync_infra::config::EngineConfig;
use innsync_infra::db;
use innsync_infra::ledger::{InMemoryInventoryLedger, InventoryLedger, PostgresInventoryLedger};
use innsync_infra::orchestrator::{OrchestratorParts, SyncOrchestrator};
use innsync_infra::queue::{InMemoryPublishQueue, PostgresPublishQueue, PublishQueue, TaskPriority};
use innsync_infra::rates::InMemoryRateTable;
use innsync_infra::reservations::InMemoryReservationDirectory;
use innsync_infra::scheduler::SyncScheduler;
use innsync_infra::sync_log::{InMemorySyncLog, PostgresSyncLog, SyncLogRecorder};

/// Channel inventory sync worker.
#[derive(Debug, Parser)]
#[command(name = "innsync-worker", version)]
struct Args {
    /// Engine configuration file (TOML).
    #[arg(long, env = "INNSYNC_CONFIG", default_value = "innsync.toml")]
    config: PathBuf,

    /// Postgres URL; without it every store is in-memory.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Queue a high-priority full sync for every connection at startup.
    #[arg(long)]
    full_sync: bool,
}

struct Stores {
    ledger: Arc<dyn InventoryLedger>,
    queue: Arc<dyn PublishQueue>,
    recorder: Arc<dyn SyncLogRecorder>,
}

async fn build_stores(config: &EngineConfig, database_url: Option<&str>) -> anyhow::Result<Stores> {
    let policy = config.queue.retry_policy();
    let Some(url) = database_url else {
        tracing::warn!("DATABASE_URL not set; using in-memory stores (state is lost on exit)");
        return Ok(Stores {
            ledger: InMemoryInventoryLedger::arc(),
            queue: InMemoryPublishQueue::arc(policy),
            recorder: InMemorySyncLog::arc(),
        });
    };

    let pool = db::connect(url).await?;
    db::ensure_schema(&pool).await?;
    Ok(Stores {
        ledger: Arc::new(PostgresInventoryLedger::new(pool.clone())),
        queue: Arc::new(PostgresPublishQueue::new(pool.clone(), policy)),
        recorder: Arc::new(PostgresSyncLog::new(pool)),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = EngineConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    innsync_observability::init(&config.logging);

    let stores = build_stores(&config, args.database_url.as_deref()).await?;
    let recovered = stores
        .queue
        .requeue_in_flight()
        .await
        .context("failed to recover in-flight publish tasks")?;
    if recovered > 0 {
        tracing::info!(recovered, "returned in-flight publish tasks to the queue");
    }

    let parts = OrchestratorParts {
        ledger: stores.ledger,
        queue: stores.queue,
        rates: Arc::new(InMemoryRateTable::new()),
        directory: Arc::new(InMemoryReservationDirectory::new()),
        recorder: stores.recorder,
        adapters: AdapterRegistry::with_defaults(),
        tiers: config.backoff.clone(),
        client: config.client.clone(),
        batch_size: config.queue.batch_size,
        full_sync_horizon_days: config.scheduler.full_sync_horizon_days,
    };
    let orchestrator = Arc::new(SyncOrchestrator::with_http(parts, Arc::new(config.connections.clone()))?);

    if args.full_sync {
        for connection_id in orchestrator.connection_ids() {
            orchestrator
                .trigger_full_sync(connection_id, TaskPriority::High)
                .await
                .with_context(|| format!("failed to queue full sync for {connection_id}"))?;
        }
    }

    tracing::info!(
        connections = orchestrator.connection_ids().len(),
        config = %args.config.display(),
        "innsync worker starting"
    );
    let scheduler = SyncScheduler::new(orchestrator, config.scheduler.clone()).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    scheduler.shutdown().await;
    Ok(())
}
