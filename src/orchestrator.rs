use std::sync::Arc;

use tracing::instrument;

use crate::aggregator::{Aggregator, ChunkResult};
use crate::cleanup::{CleanupEngine, CleanupTrigger};
use crate::error::{CoreError, Outcome};
use crate::lifecycle::JobLifecycle;
use crate::models::{ChunkIndex, Job, JobId, JobProgress, NewActivity, NewJob, Project, ProjectId, UserId};
use crate::quota::{QuotaEnforcer, RequestKind};
use crate::repository::Repository;

/// The single entry point callers outside this crate are expected to hold (§4.9). Every
/// public method here enforces ownership before touching a resource, then delegates the
/// actual state transition to the component that owns it — this struct coordinates, it does
/// not duplicate their logic.
pub struct Orchestrator {
    repo: Arc<dyn Repository>,
    quota: Arc<QuotaEnforcer>,
    lifecycle: Arc<JobLifecycle>,
    aggregator: Arc<Aggregator>,
    cleanup: Arc<CleanupEngine>,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        quota: Arc<QuotaEnforcer>,
        lifecycle: Arc<JobLifecycle>,
        aggregator: Arc<Aggregator>,
        cleanup: Arc<CleanupEngine>,
    ) -> Self {
        Self {
            repo,
            quota,
            lifecycle,
            aggregator,
            cleanup,
        }
    }

    /// Ownership failures come back as `NotFound`, identical to a resource that truly doesn't
    /// exist — callers outside the owning tenant never learn a project/job id is valid for
    /// someone else (§7 anti-enumeration rule).
    async fn require_owned_project(&self, user_id: UserId, project_id: ProjectId) -> Result<Project, CoreError> {
        let project = self.repo.get_project(project_id).await?.ok_or(CoreError::NotFound)?;
        if project.owner_user_id != user_id {
            return Err(CoreError::NotFound);
        }
        Ok(project)
    }

    async fn require_owned_job(&self, user_id: UserId, job_id: JobId) -> Result<Job, CoreError> {
        let job = self.repo.get_job(job_id).await?.ok_or(CoreError::NotFound)?;
        self.require_owned_project(user_id, job.project_id).await?;
        Ok(job)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn create_project(&self, user_id: UserId, name: &str) -> Result<Project, CoreError> {
        if name.trim().is_empty() {
            return Err(CoreError::invalid("project name must not be empty"));
        }
        self.quota.validate(user_id, RequestKind::CreateProject).await?;
        let project = self.repo.create_project(user_id, name).await?;
        self.record_activity(user_id, "create_project", "project", &project.id.to_string(), serde_json::json!({ "name": name }))
            .await;
        Ok(project)
    }

    /// Input validation and quota admission both happen here, once, at creation time — not
    /// repeated at Start. Re-validating the target count or re-checking `max_concurrent_jobs`
    /// when the job transitions to Running would count its own just-admitted Pending row a
    /// second time and could reject a job this method already accepted.
    #[instrument(skip(self, keywords), fields(user_id = %user_id, project_id))]
    pub async fn create_job(
        &self,
        user_id: UserId,
        project_id: ProjectId,
        name: String,
        keywords: Vec<String>,
        target_image_count: u32,
        priority: u8,
    ) -> Result<Job, CoreError> {
        self.require_owned_project(user_id, project_id).await?;

        if name.trim().is_empty() {
            return Err(CoreError::invalid("job name must not be empty"));
        }
        if keywords.is_empty() {
            return Err(CoreError::invalid("at least one keyword is required"));
        }
        if target_image_count == 0 {
            return Err(CoreError::invalid("target image count must be > 0"));
        }
        if priority > 10 {
            return Err(CoreError::invalid("priority must be in 0..=10"));
        }

        self.quota
            .validate(user_id, RequestKind::CreateJob { target_image_count })
            .await?;

        let mut tx = self.repo.begin().await?;
        let job = self
            .repo
            .create_job(
                &mut tx,
                NewJob {
                    project_id,
                    name,
                    keywords,
                    target_image_count,
                    priority,
                },
            )
            .await?;
        self.repo.commit(tx).await?;

        self.record_activity(user_id, "create_job", "job", &job.id.to_string(), serde_json::json!({
            "target_image_count": target_image_count,
            "priority": priority,
        }))
        .await;
        Ok(job)
    }

    #[instrument(skip(self), fields(user_id = %user_id, job_id))]
    pub async fn start_job(&self, user_id: UserId, job_id: JobId) -> Result<Outcome<Vec<String>>, CoreError> {
        self.require_owned_job(user_id, job_id).await?;
        let outcome = self.lifecycle.start(job_id).await?;
        self.record_activity(user_id, "start_job", "job", &job_id.to_string(), serde_json::json!({}))
            .await;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(user_id = %user_id, job_id))]
    pub async fn cancel_job(&self, user_id: UserId, job_id: JobId) -> Result<Outcome<u32>, CoreError> {
        self.require_owned_job(user_id, job_id).await?;
        let outcome = self.lifecycle.cancel(job_id).await?;
        self.record_activity(user_id, "cancel_job", "job", &job_id.to_string(), serde_json::json!({}))
            .await;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(user_id = %user_id, job_id))]
    pub async fn retry_job(&self, user_id: UserId, job_id: JobId) -> Result<Outcome<Vec<String>>, CoreError> {
        self.require_owned_job(user_id, job_id).await?;
        let outcome = self.lifecycle.retry(job_id).await?;
        self.record_activity(user_id, "retry_job", "job", &job_id.to_string(), serde_json::json!({}))
            .await;
        Ok(outcome)
    }

    pub async fn list_jobs(&self, user_id: UserId, limit: i64, offset: i64) -> Result<Vec<JobProgress>, CoreError> {
        let jobs = self.repo.list_jobs_by_user(user_id, limit, offset).await?;
        Ok(jobs.iter().map(JobProgress::from).collect())
    }

    pub async fn get_progress(&self, user_id: UserId, job_id: JobId) -> Result<JobProgress, CoreError> {
        let job = self.require_owned_job(user_id, job_id).await?;
        Ok(JobProgress::from(&job))
    }

    /// Worker-facing: folds one chunk's result into job/chunk state, then best-effort reclaims
    /// the chunk's temp files. Cleanup failures are logged, never surfaced — a completion that
    /// already committed to the repository must not appear to fail because disk space wasn't
    /// reclaimed (§4.6, §4.8).
    #[instrument(skip(self, result), fields(job_id = %job_id, chunk_index, external_task_id))]
    pub async fn report_completion(
        &self,
        job_id: JobId,
        chunk_index: ChunkIndex,
        external_task_id: &str,
        result: ChunkResult,
    ) -> Result<Outcome<()>, CoreError> {
        let temp_files = result.temp_files.clone();
        let outcome = self
            .aggregator
            .handle_completion(job_id, chunk_index, external_task_id, result)
            .await?;

        if matches!(outcome, Outcome::Applied(())) && !temp_files.is_empty() {
            if let Err(e) = self
                .cleanup
                .run(CleanupTrigger::ChunkCompletion {
                    job_id,
                    chunk_index,
                    files: temp_files,
                })
                .await
            {
                tracing::warn!(job_id, chunk_index, error = %e, "chunk temp-file cleanup failed");
            }
        }

        Ok(outcome)
    }

    /// Best-effort: a failed audit write is logged and swallowed, never rolled back into the
    /// mutation it describes (§9).
    async fn record_activity(
        &self,
        user_id: UserId,
        action: &str,
        subject_type: &str,
        subject_id: &str,
        metadata: serde_json::Value,
    ) {
        let entry = NewActivity {
            user_id,
            action: action.to_string(),
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            metadata,
        };
        if let Err(e) = self.repo.append_activity(entry).await {
            tracing::warn!(user_id = %user_id, action, error = %e, "activity log write failed");
        }
    }
}
