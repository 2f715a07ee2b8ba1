use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{field, instrument};

use crate::cleanup::{CleanupEngine, CleanupTrigger};
use crate::dispatcher::Dispatcher;
use crate::error::{CoreError, Outcome};
use crate::metrics::Counters;
use crate::models::{Job, JobId, JobStatus};
use crate::planner::ChunkPlanner;
use crate::queue::TaskQueue;
use crate::repository::Repository;

/// Authoritative job lifecycle (§4.7): idempotent Start / Cancel / Retry / Status. Composes
/// C2–C5 on the Start path and C8 on the Cancel path; holds no in-memory job state of its own —
/// every transition is read back from the repository before and after acting on it.
pub struct JobLifecycle {
    repo: Arc<dyn Repository>,
    planner: Arc<ChunkPlanner>,
    dispatcher: Arc<Dispatcher>,
    queue: Arc<dyn TaskQueue>,
    cleanup: Arc<CleanupEngine>,
    counters: Arc<Counters>,
}

impl JobLifecycle {
    pub fn new(
        repo: Arc<dyn Repository>,
        planner: Arc<ChunkPlanner>,
        dispatcher: Arc<Dispatcher>,
        queue: Arc<dyn TaskQueue>,
        cleanup: Arc<CleanupEngine>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            repo,
            planner,
            dispatcher,
            queue,
            cleanup,
            counters,
        }
    }

    /// Admission (quota) is enforced once, when the job is created (C9's `create_job`) — not
    /// here. Re-checking at Start would count the job's own Pending row against
    /// `max_concurrent_jobs` a second time and could reject a job the facade just admitted.
    #[instrument(skip(self), fields(job_id = %job_id, outcome = field::Empty))]
    pub async fn start(&self, job_id: JobId) -> Result<Outcome<Vec<String>>, CoreError> {
        let job = self.repo.get_job(job_id).await?.ok_or(CoreError::NotFound)?;

        match job.status {
            JobStatus::Running => {
                // IDM-START: already running — return the existing task set unchanged.
                tracing::Span::current().record("outcome", "idempotent_running");
                return Ok(Outcome::ConflictIdempotent(job.task_ids));
            }
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed | JobStatus::Cancelling => {
                return Err(CoreError::invalid(format!(
                    "cannot start a job in {} state",
                    job.status
                )));
            }
            JobStatus::Pending => {}
        }

        self.planner
            .plan(job_id, job.target_image_count, job.priority)
            .await?;
        let task_ids = self.dispatcher.dispatch(job_id).await?;

        tracing::Span::current().record("outcome", "started");
        Ok(Outcome::Applied(task_ids))
    }

    /// Cancellation is cooperative (§5): the job is marked Cancelled without waiting for worker
    /// acknowledgement of the revocations it requested. Late completions land in C6's duplicate
    /// branch and are absorbed there.
    #[instrument(skip(self), fields(job_id = %job_id, outcome = field::Empty, revoked = field::Empty))]
    pub async fn cancel(&self, job_id: JobId) -> Result<Outcome<u32>, CoreError> {
        let mut tx = self.repo.begin().await?;
        let mut job = self
            .repo
            .get_job_for_update(&mut tx, job_id)
            .await?
            .ok_or(CoreError::NotFound)?;

        if job.status.is_terminal() {
            // IDM-CANCEL: already in a terminal state — no side effects, zero revocations.
            self.repo.rollback(tx).await?;
            tracing::Span::current().record("outcome", "idempotent_terminal");
            return Ok(Outcome::ConflictIdempotent(0));
        }

        job.status = JobStatus::Cancelling;
        self.repo.update_job(&mut tx, &job).await?;
        self.repo.commit(tx).await?;

        let mut revoked = 0u32;
        for task_id in &job.task_ids {
            match self.queue.revoke(task_id, true).await {
                Ok(()) => revoked += 1,
                Err(e) => {
                    // Revocation failures never block the cancel transition (§7).
                    tracing::warn!(job_id, task_id, error = %e, "task revocation failed; continuing cancel");
                }
            }
        }

        if let Err(e) = self
            .cleanup
            .run(CleanupTrigger::CrashRecovery { job_id: Some(job_id) })
            .await
        {
            tracing::warn!(job_id, error = %e, "best-effort temp-storage cleanup failed during cancel");
        }

        let mut tx = self.repo.begin().await?;
        let mut job = self
            .repo
            .get_job_for_update(&mut tx, job_id)
            .await?
            .ok_or(CoreError::NotFound)?;
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(chrono::Utc::now());
        self.repo.update_job(&mut tx, &job).await?;
        self.repo.commit(tx).await?;

        self.counters.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::Span::current().record("outcome", "cancelled");
        tracing::Span::current().record("revoked", revoked);
        Ok(Outcome::Applied(revoked))
    }

    /// Resets every counter and identifier to the state a freshly-created job would have,
    /// without re-planning or re-dispatching (testable property #8: observable "immediately
    /// after the counter reset, before Start"). Separated from `retry` so both halves of the
    /// law are independently testable.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn reset_for_retry(&self, job_id: JobId) -> Result<Job, CoreError> {
        let mut tx = self.repo.begin().await?;
        let mut job = self
            .repo
            .get_job_for_update(&mut tx, job_id)
            .await?
            .ok_or(CoreError::NotFound)?;

        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            self.repo.rollback(tx).await?;
            return Err(CoreError::invalid(format!(
                "cannot retry a job in {} state",
                job.status
            )));
        }

        // Drop the previous attempt's chunk (and image) rows before re-planning: chunks are
        // keyed on (job_id, chunk_index), so leaving them in place would collide with the
        // freshly planned index 0..N the next Start issues.
        self.repo.delete_chunks_for_job(&mut tx, job_id).await?;

        job.total_chunks = 0;
        job.active_chunks = 0;
        job.completed_chunks = 0;
        job.failed_chunks = 0;
        job.downloaded_images = 0;
        job.valid_images = 0;
        job.duplicate_images = 0;
        job.failed_images = 0;
        job.task_ids.clear();
        job.started_at = None;
        job.completed_at = None;
        job.progress = 0;
        job.status = JobStatus::Pending;

        self.repo.update_job(&mut tx, &job).await?;
        self.repo.commit(tx).await?;
        Ok(job)
    }

    /// Reset-then-Start, per IDM-RETRY.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn retry(&self, job_id: JobId) -> Result<Outcome<Vec<String>>, CoreError> {
        self.reset_for_retry(job_id).await?;
        self.counters.jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.start(job_id).await
    }

    pub async fn status(&self, job_id: JobId) -> Result<Job, CoreError> {
        self.repo.get_job(job_id).await?.ok_or(CoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::capacity::CapacityMonitor;
    use crate::models::NewJob;
    use crate::object_store::{ObjectEntry, ObjectStore, StorageStats};
    use crate::queue::TaskSignature;
    use crate::repository_sqlx::SqlxRepository;

    struct StubQueue {
        revoked: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskQueue for StubQueue {
        async fn enqueue(&self, _signature: TaskSignature) -> Result<String, CoreError> {
            Ok(format!("task-{}", uuid::Uuid::new_v4()))
        }
        async fn revoke(&self, task_id: &str, _terminate: bool) -> Result<(), CoreError> {
            self.revoked.lock().unwrap().push(task_id.to_string());
            Ok(())
        }
    }

    struct StubStore;

    #[async_trait]
    impl ObjectStore for StubStore {
        async fn put(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), CoreError> {
            Ok(())
        }
        async fn get(&self, _key: &str) -> Result<Vec<u8>, CoreError> {
            unimplemented!()
        }
        async fn delete(&self, _key: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<ObjectEntry>, CoreError> {
            Ok(Vec::new())
        }
        async fn presign(&self, _key: &str, _ttl: std::time::Duration) -> Result<String, CoreError> {
            unimplemented!()
        }
        async fn storage_stats(&self) -> Result<Option<StorageStats>, CoreError> {
            Ok(None)
        }
    }

    async fn fixture() -> (Arc<SqlxRepository>, JobLifecycle, Arc<StubQueue>) {
        let pool = crate::db::test_pool().await;
        let repo = Arc::new(SqlxRepository::new(pool));
        let queue = Arc::new(StubQueue {
            revoked: std::sync::Mutex::new(Vec::new()),
        });
        let counters = Arc::new(Counters::default());
        let capacity = Arc::new(CapacityMonitor::new(repo.clone(), 35));
        let planner = Arc::new(ChunkPlanner::new(repo.clone(), 500));
        let dispatcher = Arc::new(Dispatcher::new(
            repo.clone(),
            queue.clone(),
            capacity,
            counters.clone(),
        ));
        let cleanup = Arc::new(CleanupEngine::new(
            repo.clone(),
            Arc::new(StubStore),
            counters.clone(),
            "/tmp".to_string(),
            95.0,
        ));
        let lifecycle = JobLifecycle::new(
            repo.clone(),
            planner,
            dispatcher,
            queue.clone(),
            cleanup,
            counters,
        );
        (repo, lifecycle, queue)
    }

    async fn seed_job(repo: &SqlxRepository, target: u32) -> JobId {
        let project = repo.create_project(Uuid::new_v4(), "proj").await.unwrap();
        let mut tx = repo.begin().await.unwrap();
        let job = repo
            .create_job(
                &mut tx,
                NewJob {
                    project_id: project.id,
                    name: "cats".into(),
                    keywords: vec!["cat".into()],
                    target_image_count: target,
                    priority: 5,
                },
            )
            .await
            .unwrap();
        repo.commit(tx).await.unwrap();
        job.id
    }

    #[tokio::test]
    async fn start_plans_and_dispatches_a_pending_job() {
        let (repo, lifecycle, _queue) = fixture().await;
        let job_id = seed_job(&repo, 1000).await;

        let outcome = lifecycle.start(job_id).await.unwrap();
        let task_ids = outcome.into_inner();
        assert_eq!(task_ids.len(), 2);

        let job = repo.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.total_chunks, 2);
    }

    #[tokio::test]
    async fn start_on_running_job_is_idempotent_noop() {
        let (repo, lifecycle, _queue) = fixture().await;
        let job_id = seed_job(&repo, 500).await;
        let first = lifecycle.start(job_id).await.unwrap();
        let second = lifecycle.start(job_id).await.unwrap();
        assert!(!first.is_idempotent_noop());
        assert!(second.is_idempotent_noop());
        assert_eq!(first.into_inner(), second.into_inner());
    }

    #[tokio::test]
    async fn start_on_terminal_job_is_refused() {
        let (repo, lifecycle, _queue) = fixture().await;
        let job_id = seed_job(&repo, 500).await;
        let job = repo.get_job(job_id).await.unwrap().unwrap();
        let mut tx = repo.begin().await.unwrap();
        let mut job = job;
        job.status = JobStatus::Completed;
        repo.update_job(&mut tx, &job).await.unwrap();
        repo.commit(tx).await.unwrap();

        let err = lifecycle.start(job_id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn cancel_running_job_revokes_every_task_and_is_idempotent() {
        let (repo, lifecycle, queue) = fixture().await;
        let job_id = seed_job(&repo, 1500).await;
        lifecycle.start(job_id).await.unwrap();

        let first = lifecycle.cancel(job_id).await.unwrap();
        assert_eq!(first.into_inner(), 3);
        assert_eq!(queue.revoked.lock().unwrap().len(), 3);

        let job = repo.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        let second = lifecycle.cancel(job_id).await.unwrap();
        assert!(second.is_idempotent_noop());
        assert_eq!(second.into_inner(), 0);
        assert_eq!(queue.revoked.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cancel_pending_job_transitions_straight_to_cancelled() {
        let (repo, lifecycle, _queue) = fixture().await;
        let job_id = seed_job(&repo, 500).await;
        lifecycle.cancel(job_id).await.unwrap();
        let job = repo.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn reset_for_retry_zeroes_every_counter_before_start() {
        let (repo, lifecycle, _queue) = fixture().await;
        let job_id = seed_job(&repo, 1500).await;
        lifecycle.start(job_id).await.unwrap();
        lifecycle.cancel(job_id).await.unwrap();

        let job = lifecycle.reset_for_retry(job_id).await.unwrap();
        assert_eq!(job.total_chunks, 0);
        assert_eq!(job.active_chunks, 0);
        assert_eq!(job.completed_chunks, 0);
        assert_eq!(job.failed_chunks, 0);
        assert_eq!(job.downloaded_images, 0);
        assert!(job.task_ids.is_empty());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn retry_replans_and_redispatches_fresh_chunks() {
        let (repo, lifecycle, _queue) = fixture().await;
        let job_id = seed_job(&repo, 1500).await;
        lifecycle.start(job_id).await.unwrap();
        lifecycle.cancel(job_id).await.unwrap();

        let outcome = lifecycle.retry(job_id).await.unwrap();
        assert_eq!(outcome.into_inner().len(), 3);
        let job = repo.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.total_chunks, 3);

        // Re-planning must not collide with the cancelled attempt's chunk rows (keyed on
        // (job_id, chunk_index)) — exactly one set of fresh chunks should exist, not a stale
        // row per attempt.
        let chunks = repo.list_chunks_for_job(job_id).await.unwrap();
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn retry_on_non_terminal_job_is_refused() {
        let (repo, lifecycle, _queue) = fixture().await;
        let job_id = seed_job(&repo, 500).await;
        let err = lifecycle.retry(job_id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }
}
