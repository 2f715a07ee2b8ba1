use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use chunk_orchestrator::aggregator::Aggregator;
use chunk_orchestrator::capacity::CapacityMonitor;
use chunk_orchestrator::cleanup::{self, CleanupEngine};
use chunk_orchestrator::config::Config;
use chunk_orchestrator::db::Db;
use chunk_orchestrator::dispatcher::Dispatcher;
use chunk_orchestrator::error::{CoreError, Tier};
use chunk_orchestrator::lifecycle::JobLifecycle;
use chunk_orchestrator::local_store::LocalFsObjectStore;
use chunk_orchestrator::logger::init_tracing;
use chunk_orchestrator::metrics::Counters;
use chunk_orchestrator::models::UserId;
use chunk_orchestrator::object_store::ObjectStore;
use chunk_orchestrator::orchestrator::Orchestrator;
use chunk_orchestrator::planner::ChunkPlanner;
use chunk_orchestrator::profile::{ProfileProvider, UserProfile};
use chunk_orchestrator::queue::{TaskQueue, TaskSignature};
use chunk_orchestrator::quota::QuotaEnforcer;
use chunk_orchestrator::repository::Repository;
use chunk_orchestrator::repository_sqlx::SqlxRepository;

/// Stands in for the real distributed task queue (Celery, SQS, whatever the deployment picks).
/// Logs every enqueue/revoke instead of dispatching anywhere, so the orchestrator is runnable
/// standalone for local development and the integration tests.
struct LoggingTaskQueue;

#[async_trait]
impl TaskQueue for LoggingTaskQueue {
    async fn enqueue(&self, signature: TaskSignature) -> Result<String, CoreError> {
        // TODO: Replace with a real broker client (e.g. Celery-compatible AMQP producer).
        let task_id = format!("local-{}", Uuid::new_v4());
        tracing::info!(
            task_id,
            operation = %signature.operation_name,
            queue = %signature.target_queue_name,
            "enqueued task on the logging stand-in queue"
        );
        Ok(task_id)
    }

    async fn revoke(&self, task_id: &str, terminate: bool) -> Result<(), CoreError> {
        tracing::info!(task_id, terminate, "revoked task on the logging stand-in queue");
        Ok(())
    }
}

/// Stands in for the real auth/profile service. Every tenant resolves to the Free tier, which
/// is the conservative choice for a bootstrap deployment with no upstream identity provider
/// wired in yet.
struct StaticFreeTierProfiles;

#[async_trait]
impl ProfileProvider for StaticFreeTierProfiles {
    async fn verify(&self, _token: &str) -> Result<UserId, CoreError> {
        // TODO: Replace with real token verification against the upstream auth service.
        Err(CoreError::external("token verification is not wired up"))
    }

    async fn profile(&self, _user_id: UserId) -> Result<UserProfile, CoreError> {
        Ok(UserProfile {
            role: "member".to_string(),
            tier: Tier::Free,
        })
    }
}

/// Connects, migrates, and wraps the repository — the one async step every other component
/// construction depends on.
async fn init_repository(cfg: &Config) -> anyhow::Result<Arc<SqlxRepository>> {
    let db = Db::connect(&cfg.database_url).await?;
    db.migrate().await?;
    Ok(Arc::new(SqlxRepository::new((*db.pool).clone())))
}

/// Wires every component named in the facade's constructor from one shared repository,
/// counters set, queue, and profile provider.
fn build_orchestrator(
    cfg: &Config,
    repo: Arc<SqlxRepository>,
    queue: Arc<dyn TaskQueue>,
    profiles: Arc<dyn ProfileProvider>,
    store: Arc<dyn ObjectStore>,
    counters: Arc<Counters>,
) -> (Orchestrator, Arc<CleanupEngine>) {
    let repo: Arc<dyn Repository> = repo;

    let quota = Arc::new(QuotaEnforcer::new(repo.clone(), profiles, counters.clone()));
    let capacity = Arc::new(CapacityMonitor::new(repo.clone(), cfg.effective_max_chunks()));
    let planner = Arc::new(ChunkPlanner::new(repo.clone(), cfg.resource_chunk_size_images));
    let dispatcher = Arc::new(Dispatcher::new(repo.clone(), queue.clone(), capacity, counters.clone()));
    let cleanup = Arc::new(CleanupEngine::new(
        repo.clone(),
        store,
        counters.clone(),
        cfg.cleanup_temp_storage_path.clone(),
        cfg.cleanup_emergency_threshold,
    ));
    let lifecycle = Arc::new(JobLifecycle::new(
        repo.clone(),
        planner,
        dispatcher,
        queue,
        cleanup.clone(),
        counters.clone(),
    ));
    let aggregator = Arc::new(Aggregator::new(repo.clone(), counters));

    (
        Orchestrator::new(repo, quota, lifecycle, aggregator, cleanup.clone()),
        cleanup,
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let cfg = Config::from_env();
    init_tracing(cfg.log_json);

    tracing::info!("starting chunk orchestrator");

    let repo = init_repository(&cfg).await?;
    let counters = Arc::new(Counters::default());
    let queue: Arc<dyn TaskQueue> = Arc::new(LoggingTaskQueue);
    let profiles: Arc<dyn ProfileProvider> = Arc::new(StaticFreeTierProfiles);
    let total_storage_bytes = cfg.resource_max_temp_storage_mb * 1024 * 1024;
    let store: Arc<dyn ObjectStore> = Arc::new(LocalFsObjectStore::new(
        cfg.cleanup_temp_storage_path.clone(),
        total_storage_bytes,
    ));

    // No HTTP/RPC surface ships with this core; `_orchestrator` is what an embedding service
    // would hold onto and call into from its own request handlers.
    let (_orchestrator, cleanup_engine) =
        build_orchestrator(&cfg, repo, queue, profiles, store, counters);

    cleanup::spawn_scheduled(cleanup_engine, Duration::from_secs(3600));

    tracing::info!("chunk orchestrator started; waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    Ok(())
}
