use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::models::{
    Activity, Chunk, ChunkIndex, Job, JobId, NewActivity, NewChunk, NewImage, NewJob, Project,
    ProjectId, UserId,
};

/// A transaction on the runtime-agnostic pool. Every mutating `Repository` method takes one by
/// `&mut` reference supplied by the caller — the repository never opens or commits its own.
pub type Tx = sqlx::Transaction<'static, sqlx::Any>;

/// Typed CRUD over the persisted entities, plus the transactional row-locking primitive
/// (`get_job_for_update`) that C6's exactly-once semantics hinge on.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn begin(&self) -> Result<Tx, CoreError>;
    async fn commit(&self, tx: Tx) -> Result<(), CoreError>;
    async fn rollback(&self, tx: Tx) -> Result<(), CoreError>;

    async fn create_project(&self, owner: UserId, name: &str) -> Result<Project, CoreError>;
    async fn get_project(&self, project_id: ProjectId) -> Result<Option<Project>, CoreError>;

    async fn create_job(&self, tx: &mut Tx, new_job: NewJob) -> Result<Job, CoreError>;
    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, CoreError>;

    /// Returns the job row under a transactional exclusive lock scoped to `tx`; blocks
    /// concurrent writers to that row until `tx` commits or rolls back.
    async fn get_job_for_update(&self, tx: &mut Tx, job_id: JobId) -> Result<Option<Job>, CoreError>;

    async fn update_job(&self, tx: &mut Tx, job: &Job) -> Result<(), CoreError>;

    async fn list_jobs_by_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, CoreError>;

    async fn list_chunks_for_job(&self, job_id: JobId) -> Result<Vec<Chunk>, CoreError>;

    async fn get_chunk(
        &self,
        tx: &mut Tx,
        job_id: JobId,
        chunk_index: ChunkIndex,
    ) -> Result<Option<Chunk>, CoreError>;

    /// Single round-trip insertion.
    async fn bulk_create_chunks(&self, tx: &mut Tx, records: &[NewChunk]) -> Result<(), CoreError>;

    /// Deletes every chunk (and its child images) belonging to `job_id`. Retry's reset must
    /// call this before re-planning: `chunks` is keyed on `(job_id, chunk_index)`, so a stale
    /// row from the previous attempt would collide with the freshly planned index 0..N.
    async fn delete_chunks_for_job(&self, tx: &mut Tx, job_id: JobId) -> Result<(), CoreError>;

    async fn update_chunk(&self, tx: &mut Tx, chunk: &Chunk) -> Result<(), CoreError>;

    async fn bulk_insert_images(&self, tx: &mut Tx, records: &[NewImage]) -> Result<(), CoreError>;

    /// Fire-and-forget audit write, called after commit (§9). A failure here is logged by the
    /// caller and never rolls back the mutation it describes.
    async fn append_activity(&self, entry: NewActivity) -> Result<(), CoreError>;

    async fn sum_active_chunks_across_all_jobs(&self) -> Result<i64, CoreError>;

    async fn count_concurrent_jobs(&self, user_id: UserId) -> Result<i64, CoreError>;
    async fn count_jobs_today(&self, user_id: UserId) -> Result<i64, CoreError>;
    async fn count_projects(&self, user_id: UserId) -> Result<i64, CoreError>;
    async fn count_team_members(&self, project_id: ProjectId) -> Result<i64, CoreError>;

    /// Ids of jobs not yet in a terminal state — the cleanup engine's orphan detector needs
    /// this to classify temp files without re-deriving job-status logic itself.
    async fn list_active_job_ids(&self) -> Result<Vec<JobId>, CoreError>;

    /// Ids of jobs in {Failed, Cancelled} whose `updated_at` is older than `cutoff`.
    async fn list_old_failed_job_ids(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, CoreError>;

    #[allow(dead_code)]
    async fn list_activity_for_subject(
        &self,
        subject_type: &str,
        subject_id: &str,
    ) -> Result<Vec<Activity>, CoreError>;
}
