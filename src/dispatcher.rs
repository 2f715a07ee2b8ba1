use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{field, instrument};

use crate::capacity::CapacityMonitor;
use crate::error::CoreError;
use crate::metrics::Counters;
use crate::models::{ChunkStatus, Job, JobId, JobStatus};
use crate::queue::{TaskQueue, TaskSignature};
use crate::repository::Repository;

/// Submits chunk signatures to the external task queue and tracks returned task ids (§4.5).
///
/// A single `dispatch(job_id)` call run synchronously inside `StartJob`/`RetryJob`, not a
/// background worker pool — the queue and the workers are the system's actual back-pressure,
/// so there is no per-job consumer loop to route work into.
pub struct Dispatcher {
    repo: Arc<dyn Repository>,
    queue: Arc<dyn TaskQueue>,
    capacity: Arc<CapacityMonitor>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn new(
        repo: Arc<dyn Repository>,
        queue: Arc<dyn TaskQueue>,
        capacity: Arc<CapacityMonitor>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            repo,
            queue,
            capacity,
            counters,
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id, outcome = field::Empty))]
    pub async fn dispatch(&self, job_id: JobId) -> Result<Vec<String>, CoreError> {
        let mut tx = self.repo.begin().await?;

        let mut job = self
            .repo
            .get_job_for_update(&mut tx, job_id)
            .await?
            .ok_or(CoreError::NotFound)?;

        if job.status != JobStatus::Pending {
            // IDM-START: already running (or beyond) — return the existing task set unchanged.
            self.repo.rollback(tx).await?;
            tracing::Span::current().record("outcome", "idempotent_noop");
            return Ok(job.task_ids);
        }

        if !self.capacity.can_admit(job.total_chunks).await {
            // The ceiling is advisory at dispatch time; enforcement happens per-chunk at the
            // queue. Implementations MAY refuse here — this one logs and keeps going.
            self.counters
                .dispatch_capacity_warnings
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                job_id,
                total_chunks = job.total_chunks,
                available = self.capacity.available().await,
                "dispatching over the advisory capacity ceiling"
            );
        }

        let mut chunks = self.repo.list_chunks_for_job(job_id).await?;
        chunks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.chunk_index.cmp(&b.chunk_index))
        });

        let mut task_ids = Vec::with_capacity(chunks.len());
        for mut chunk in chunks {
            let signature = TaskSignature {
                operation_name: "crawl_chunk".to_string(),
                positional_args: Vec::new(),
                keyword_args: build_keyword_args(&job, chunk.chunk_index, chunk.range_start, chunk.range_end),
                target_queue_name: "crawl".to_string(),
                priority: chunk.priority,
            };

            let task_id = match self.queue.enqueue(signature).await {
                Ok(id) => id,
                Err(e) => {
                    self.repo.rollback(tx).await?;
                    tracing::Span::current().record("outcome", classify_error(&e).as_str());
                    return Err(e);
                }
            };

            chunk.task_id = Some(task_id.clone());
            chunk.status = ChunkStatus::Processing;
            self.repo.update_chunk(&mut tx, &chunk).await?;

            job.task_ids.push(task_id.clone());
            task_ids.push(task_id);

            self.counters
                .chunks_dispatched
                .fetch_add(1, Ordering::Relaxed);
        }

        job.status = JobStatus::Running;
        job.started_at = Some(chrono::Utc::now());
        self.repo.update_job(&mut tx, &job).await?;
        self.repo.commit(tx).await?;

        tracing::Span::current().record("outcome", "dispatched");
        Ok(task_ids)
    }
}

fn build_keyword_args(
    job: &Job,
    chunk_index: i32,
    range_start: u32,
    range_end: u32,
) -> serde_json::Map<String, serde_json::Value> {
    let mut args = serde_json::Map::new();
    args.insert("job_id".into(), serde_json::json!(job.id));
    args.insert("chunk_id".into(), serde_json::json!(chunk_index));
    args.insert(
        "image_range".into(),
        serde_json::json!([range_start, range_end]),
    );
    args.insert("keywords".into(), serde_json::json!(job.keywords));
    args.insert("engine".into(), serde_json::json!("default"));
    args
}

/// Truncates an external-dependency error to a stable, loggable string — the same
/// truncate-or-match-known-substring pattern used to normalize executor failures.
fn classify_error(e: &CoreError) -> String {
    let s = e.to_string();
    const MAX: usize = 160;
    if s.len() > MAX {
        format!("ERR:{}", &s[..MAX])
    } else {
        s
    }
}

#[allow(dead_code)]
fn chunk_status_is_terminal(s: ChunkStatus) -> bool {
    matches!(s, ChunkStatus::Completed | ChunkStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::capacity::CapacityMonitor;
    use crate::planner::ChunkPlanner;
    use crate::repository_sqlx::SqlxRepository;

    struct StubQueue {
        next_id: Mutex<u64>,
        fail: bool,
    }

    impl StubQueue {
        fn new() -> Self {
            Self {
                next_id: Mutex::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl TaskQueue for StubQueue {
        async fn enqueue(&self, _signature: TaskSignature) -> Result<String, CoreError> {
            if self.fail {
                return Err(CoreError::external("queue unreachable"));
            }
            let mut n = self.next_id.lock().unwrap();
            *n += 1;
            Ok(format!("task-{n}"))
        }
        async fn revoke(&self, _task_id: &str, _terminate: bool) -> Result<(), CoreError> {
            Ok(())
        }
    }

    async fn seed_job(repo: &SqlxRepository, target_image_count: u32) -> JobId {
        let project = repo
            .create_project(Uuid::new_v4(), "proj")
            .await
            .unwrap();
        let mut tx = repo.begin().await.unwrap();
        let job = repo
            .create_job(
                &mut tx,
                crate::models::NewJob {
                    project_id: project.id,
                    name: "cats".into(),
                    keywords: vec!["cat".into()],
                    target_image_count,
                    priority: 5,
                },
            )
            .await
            .unwrap();
        repo.commit(tx).await.unwrap();
        job.id
    }

    async fn fixture() -> (Arc<SqlxRepository>, Arc<StubQueue>, Arc<Counters>, Arc<CapacityMonitor>) {
        let pool = crate::db::test_pool().await;
        let repo = Arc::new(SqlxRepository::new(pool));
        let queue = Arc::new(StubQueue::new());
        let counters = Arc::new(Counters::default());
        let capacity = Arc::new(CapacityMonitor::new(repo.clone(), 35));
        (repo, queue, counters, capacity)
    }

    #[tokio::test]
    async fn dispatch_enqueues_every_chunk_in_priority_then_index_order() {
        let (repo, queue, counters, capacity) = fixture().await;
        let job_id = seed_job(&repo, 1000).await;

        let planner = ChunkPlanner::new(repo.clone(), 500);
        planner.plan(job_id, 1000, 5).await.unwrap();

        let dispatcher = Dispatcher::new(repo.clone(), queue.clone(), capacity, counters.clone());
        let task_ids = dispatcher.dispatch(job_id).await.unwrap();

        assert_eq!(task_ids.len(), 2);
        assert_eq!(counters.chunks_dispatched.load(Ordering::Relaxed), 2);

        let job = repo.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.task_ids, task_ids);
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn dispatch_moves_every_chunk_to_processing() {
        let (repo, queue, counters, capacity) = fixture().await;
        let job_id = seed_job(&repo, 1000).await;
        let planner = ChunkPlanner::new(repo.clone(), 500);
        planner.plan(job_id, 1000, 5).await.unwrap();

        let dispatcher = Dispatcher::new(repo.clone(), queue.clone(), capacity, counters.clone());
        dispatcher.dispatch(job_id).await.unwrap();

        let chunks = repo.list_chunks_for_job(job_id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Processing));
        assert!(chunks.iter().all(|c| c.task_id.is_some()));
    }

    #[tokio::test]
    async fn dispatch_on_running_job_is_idempotent() {
        let (repo, queue, counters, capacity) = fixture().await;
        let job_id = seed_job(&repo, 500).await;
        let planner = ChunkPlanner::new(repo.clone(), 500);
        planner.plan(job_id, 500, 5).await.unwrap();

        let dispatcher = Dispatcher::new(repo.clone(), queue.clone(), capacity, counters.clone());
        let first = dispatcher.dispatch(job_id).await.unwrap();
        let second = dispatcher.dispatch(job_id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(counters.chunks_dispatched.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn dispatch_over_capacity_warns_but_still_admits() {
        let (repo, queue, counters, _capacity) = fixture().await;
        let job_id = seed_job(&repo, 2000).await;
        let planner = ChunkPlanner::new(repo.clone(), 500);
        planner.plan(job_id, 2000, 5).await.unwrap();

        let tiny_capacity = Arc::new(CapacityMonitor::new(repo.clone(), 1));
        let dispatcher = Dispatcher::new(repo.clone(), queue.clone(), tiny_capacity, counters.clone());
        let task_ids = dispatcher.dispatch(job_id).await.unwrap();

        assert_eq!(task_ids.len(), 4);
        assert_eq!(counters.dispatch_capacity_warnings.load(Ordering::Relaxed), 1);
    }
}
