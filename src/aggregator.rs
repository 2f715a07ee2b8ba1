use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{field, instrument};

use crate::error::{CoreError, Outcome};
use crate::metrics::Counters;
use crate::models::{ChunkIndex, ChunkStatus, JobId, JobStatus, NewImage};
use crate::repository::Repository;

/// What a worker reports back for one chunk.
pub struct ChunkResult {
    pub ok: bool,
    pub downloaded_count: u64,
    pub images: Vec<NewImage>,
    pub error: Option<String>,
    /// Object-store keys the chunk wrote under its temp prefix, passed straight through to
    /// the cleanup engine's `ChunkCompletion` trigger once this result is folded in.
    pub temp_files: Vec<String>,
}

/// Consumes per-chunk completion events and folds them into job/chunk state under a single
/// exclusive row lock, so replays and out-of-order deliveries never double-count (§4.6).
pub struct Aggregator {
    repo: Arc<dyn Repository>,
    counters: Arc<Counters>,
}

impl Aggregator {
    pub fn new(repo: Arc<dyn Repository>, counters: Arc<Counters>) -> Self {
        Self { repo, counters }
    }

    #[instrument(skip(self, result), fields(job_id = %job_id, chunk_index, external_task_id, outcome = field::Empty))]
    pub async fn handle_completion(
        &self,
        job_id: JobId,
        chunk_index: ChunkIndex,
        external_task_id: &str,
        result: ChunkResult,
    ) -> Result<Outcome<()>, CoreError> {
        let mut tx = self.repo.begin().await?;

        let mut job = self
            .repo
            .get_job_for_update(&mut tx, job_id)
            .await?
            .ok_or(CoreError::NotFound)?;

        let mut chunk = self
            .repo
            .get_chunk(&mut tx, job_id, chunk_index)
            .await?
            .ok_or(CoreError::NotFound)?;

        match chunk.status {
            ChunkStatus::Completed | ChunkStatus::Failed => {
                // IDM-RESULT: the queue redelivered a result we already folded in.
                self.repo.rollback(tx).await?;
                self.counters
                    .completions_deduplicated
                    .fetch_add(1, Ordering::Relaxed);
                tracing::Span::current().record("outcome", "duplicate");
                return Ok(Outcome::ConflictIdempotent(()));
            }
            ChunkStatus::Pending => {
                tracing::warn!(
                    job_id,
                    chunk_index,
                    external_task_id,
                    "completion observed before dispatch was recorded; treating as in-flight"
                );
            }
            ChunkStatus::Processing => {}
        }

        for image in &result.images {
            debug_assert_eq!(image.job_id, job_id);
            debug_assert_eq!(image.chunk_index, chunk_index);
        }
        self.repo.bulk_insert_images(&mut tx, &result.images).await?;

        chunk.status = if result.ok {
            ChunkStatus::Completed
        } else {
            ChunkStatus::Failed
        };
        chunk.error_message = result.error.clone();
        self.repo.update_chunk(&mut tx, &chunk).await?;

        job.active_chunks = job.active_chunks.saturating_sub(1);
        if result.ok {
            job.completed_chunks += 1;
        } else {
            job.failed_chunks += 1;
        }
        job.downloaded_images += result.downloaded_count;
        job.valid_images += result.images.iter().filter(|i| i.is_valid).count() as u64;
        job.duplicate_images += result.images.iter().filter(|i| i.is_duplicate).count() as u64;

        let done = job.completed_chunks + job.failed_chunks;
        job.progress = if job.total_chunks == 0 {
            100
        } else {
            ((done as u64 * 100) / job.total_chunks as u64).min(100) as u8
        };

        if job.active_chunks == 0 {
            // Terminal rule (§4.6 step 7, Open Question resolved): any mix of successes and
            // failures still settles as Completed — only an all-failed job is Failed.
            job.status = if job.completed_chunks == 0 {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            job.completed_at = Some(chrono::Utc::now());
        }

        self.repo.update_job(&mut tx, &job).await?;
        self.repo.commit(tx).await?;

        self.counters
            .completions_accepted
            .fetch_add(1, Ordering::Relaxed);
        tracing::Span::current().record("outcome", "applied");
        Ok(Outcome::Applied(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use crate::planner::ChunkPlanner;
    use crate::repository_sqlx::SqlxRepository;

    async fn seed_job_with_chunks(
        repo: &SqlxRepository,
        target: u32,
        chunk_size: u32,
    ) -> JobId {
        let project = repo.create_project(Uuid::new_v4(), "proj").await.unwrap();
        let mut tx = repo.begin().await.unwrap();
        let job = repo
            .create_job(
                &mut tx,
                crate::models::NewJob {
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

        let planner = ChunkPlanner::new(Arc::new(SqlxRepository::new(repo.pool().clone())), chunk_size);
        planner.plan(job.id, target, 5).await.unwrap();

        // Move every chunk to Processing, as dispatch would have.
        let chunks = repo.list_chunks_for_job(job.id).await.unwrap();
        let mut tx = repo.begin().await.unwrap();
        for mut c in chunks {
            c.status = ChunkStatus::Processing;
            c.task_id = Some(format!("task-{}", c.chunk_index));
            repo.update_chunk(&mut tx, &c).await.unwrap();
        }
        repo.commit(tx).await.unwrap();
        job.id
    }

    fn ok_result(job_id: JobId, chunk_index: ChunkIndex, valid: u64, dup: u64) -> ChunkResult {
        let mut images = Vec::new();
        for i in 0..valid {
            images.push(NewImage {
                job_id,
                chunk_index,
                source_url: format!("http://x/{i}"),
                filename: format!("{i}.jpg"),
                storage_key: None,
                content_metadata: None,
                is_valid: true,
                is_duplicate: false,
                validation_metadata: None,
            });
        }
        for i in 0..dup {
            images.push(NewImage {
                job_id,
                chunk_index,
                source_url: format!("http://x/dup{i}"),
                filename: format!("dup{i}.jpg"),
                storage_key: None,
                content_metadata: None,
                is_valid: false,
                is_duplicate: true,
                validation_metadata: None,
            });
        }
        ChunkResult {
            ok: true,
            downloaded_count: valid + dup,
            images,
            error: None,
            temp_files: Vec::new(),
        }
    }

    #[tokio::test]
    async fn single_chunk_completion_transitions_job_to_completed() {
        let pool = crate::db::test_pool().await;
        let repo = Arc::new(SqlxRepository::new(pool));
        let job_id = seed_job_with_chunks(&repo, 500, 500).await;

        let agg = Aggregator::new(repo.clone(), Arc::new(Counters::default()));
        let outcome = agg
            .handle_completion(job_id, 0, "task-0", ok_result(job_id, 0, 500, 0))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Applied(()));

        let job = repo.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.active_chunks, 0);
        assert_eq!(job.completed_chunks, 1);
        assert_eq!(job.downloaded_images, 500);
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_completion_is_a_no_op() {
        let pool = crate::db::test_pool().await;
        let repo = Arc::new(SqlxRepository::new(pool));
        let job_id = seed_job_with_chunks(&repo, 500, 500).await;
        let counters = Arc::new(Counters::default());
        let agg = Aggregator::new(repo.clone(), counters.clone());

        agg.handle_completion(job_id, 0, "task-0", ok_result(job_id, 0, 500, 0))
            .await
            .unwrap();
        let replay = agg
            .handle_completion(job_id, 0, "task-0", ok_result(job_id, 0, 500, 0))
            .await
            .unwrap();

        assert!(replay.is_idempotent_noop());
        let job = repo.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.downloaded_images, 500);
        assert_eq!(counters.completions_deduplicated.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn mixed_outcome_across_chunks_settles_as_completed() {
        let pool = crate::db::test_pool().await;
        let repo = Arc::new(SqlxRepository::new(pool));
        let job_id = seed_job_with_chunks(&repo, 1000, 500).await;

        let agg = Aggregator::new(repo.clone(), Arc::new(Counters::default()));
        agg.handle_completion(job_id, 0, "task-0", ok_result(job_id, 0, 400, 10))
            .await
            .unwrap();
        agg.handle_completion(
            job_id,
            1,
            "task-1",
            ChunkResult {
                ok: false,
                downloaded_count: 0,
                images: Vec::new(),
                error: Some("download timed out".into()),
                temp_files: Vec::new(),
            },
        )
        .await
        .unwrap();

        let job = repo.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_chunks, 1);
        assert_eq!(job.failed_chunks, 1);
        assert_eq!(job.active_chunks, 0);
    }

    #[tokio::test]
    async fn all_chunks_failing_settles_job_as_failed() {
        let pool = crate::db::test_pool().await;
        let repo = Arc::new(SqlxRepository::new(pool));
        let job_id = seed_job_with_chunks(&repo, 500, 500).await;

        let agg = Aggregator::new(repo.clone(), Arc::new(Counters::default()));
        agg.handle_completion(
            job_id,
            0,
            "task-0",
            ChunkResult {
                ok: false,
                downloaded_count: 0,
                images: Vec::new(),
                error: Some("blocked by upstream".into()),
                temp_files: Vec::new(),
            },
        )
        .await
        .unwrap();

        let job = repo.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_chunks, 1);
    }
}
