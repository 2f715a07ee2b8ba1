use std::sync::Arc;

use tracing::{field, instrument};

use crate::error::CoreError;
use crate::models::{Job, JobId, NewChunk};
use crate::repository::Repository;

/// Splits a job's target image count into fixed-size chunks and persists them in one
/// transaction, updating the parent job's chunk-tracking counters (§4.3).
pub struct ChunkPlanner {
    repo: Arc<dyn Repository>,
    chunk_size: u32,
}

impl ChunkPlanner {
    pub fn new(repo: Arc<dyn Repository>, chunk_size: u32) -> Self {
        Self { repo, chunk_size }
    }

    #[instrument(skip(self), fields(job_id = %job_id, target_image_count, chunk_count = field::Empty))]
    pub async fn plan(
        &self,
        job_id: JobId,
        target_image_count: u32,
        priority: u8,
    ) -> Result<Vec<NewChunk>, CoreError> {
        tracing::Span::current().record("target_image_count", target_image_count);
        if target_image_count == 0 {
            return Err(CoreError::invalid("target image count must be > 0"));
        }
        if priority > 10 {
            return Err(CoreError::invalid("priority must be in 0..=10"));
        }

        let chunks = split_into_chunks(job_id, target_image_count, priority, self.chunk_size);
        tracing::Span::current().record("chunk_count", chunks.len());

        let mut tx = self.repo.begin().await?;
        self.repo.bulk_create_chunks(&mut tx, &chunks).await?;

        let mut job = self
            .repo
            .get_job(job_id)
            .await?
            .ok_or(CoreError::NotFound)?;
        job.total_chunks = chunks.len() as u32;
        job.active_chunks = chunks.len() as u32;
        self.repo.update_job(&mut tx, &job).await?;
        self.repo.commit(tx).await?;

        Ok(chunks)
    }
}

/// `N = ceil(M / CHUNK_SIZE)` fixed-size chunks, contiguous index from 0, each range
/// `[i*CHUNK_SIZE, min((i+1)*CHUNK_SIZE, M) - 1]`.
fn split_into_chunks(job_id: JobId, target: u32, priority: u8, chunk_size: u32) -> Vec<NewChunk> {
    let n = target.div_ceil(chunk_size);
    (0..n)
        .map(|i| {
            let start = i * chunk_size;
            let end = ((i + 1) * chunk_size).min(target) - 1;
            NewChunk {
                job_id,
                chunk_index: i as i32,
                priority,
                range_start: start,
                range_end: end,
            }
        })
        .collect()
}

/// Reports whether `job` still satisfies testable property #2: for jobs past planning, the
/// chunk ranges form a partition of `[0, target_image_count)`.
pub fn ranges_partition_target(job: &Job, chunks: &[NewChunk]) -> bool {
    if job.total_chunks as usize != chunks.len() {
        return false;
    }
    let mut sorted = chunks.to_vec();
    sorted.sort_by_key(|c| c.chunk_index);
    let mut expect_start = 0u32;
    for c in &sorted {
        if c.range_start != expect_start {
            return false;
        }
        expect_start = c.range_end + 1;
    }
    expect_start == job.target_image_count
}
