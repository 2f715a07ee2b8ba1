use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{AnyPool, Row};

use crate::error::CoreError;
use crate::logger::warn_if_slow;
use crate::models::{
    Activity, Chunk, ChunkIndex, ChunkStatus, Job, JobId, JobStatus, NewActivity, NewChunk,
    NewImage, NewJob, Project, ProjectId, UserId,
};
use crate::repository::{Repository, Tx};

/// SQLx-backed implementation of `Repository`. Responsible only for persistence and row
/// mapping; every composite mutation is driven by a transaction the caller supplies.
pub struct SqlxRepository {
    pool: AnyPool,
}

impl SqlxRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

async fn alloc_id_pool(pool: &AnyPool, name: &str) -> Result<i64, CoreError> {
    loop {
        let row = sqlx::query("SELECT next_value FROM id_counters WHERE name = ?")
            .bind(name)
            .fetch_one(pool)
            .await?;
        let cur: i64 = row.get(0);
        let res = sqlx::query(
            "UPDATE id_counters SET next_value = ? WHERE name = ? AND next_value = ?",
        )
        .bind(cur + 1)
        .bind(name)
        .bind(cur)
        .execute(pool)
        .await?;
        if res.rows_affected() == 1 {
            return Ok(cur);
        }
    }
}

async fn alloc_id_tx(tx: &mut Tx, name: &str) -> Result<i64, CoreError> {
    loop {
        let row = sqlx::query("SELECT next_value FROM id_counters WHERE name = ?")
            .bind(name)
            .fetch_one(&mut **tx)
            .await?;
        let cur: i64 = row.get(0);
        let res = sqlx::query(
            "UPDATE id_counters SET next_value = ? WHERE name = ? AND next_value = ?",
        )
        .bind(cur + 1)
        .bind(name)
        .bind(cur)
        .execute(&mut **tx)
        .await?;
        if res.rows_affected() == 1 {
            return Ok(cur);
        }
    }
}

fn row_to_job(r: &sqlx::any::AnyRow) -> Result<Job, CoreError> {
    let status_s: String = r.get("status");
    let status = JobStatus::parse(&status_s)
        .ok_or_else(|| CoreError::external(format!("unrecognized job status: {status_s}")))?;
    let keywords_s: String = r.get("keywords");
    let keywords: Vec<String> = serde_json::from_str(&keywords_s)
        .map_err(|e| CoreError::external(format!("corrupt keywords json: {e}")))?;
    let task_ids_s: String = r.get("task_ids");
    let task_ids: Vec<String> = serde_json::from_str(&task_ids_s)
        .map_err(|e| CoreError::external(format!("corrupt task_ids json: {e}")))?;

    Ok(Job {
        id: r.get("id"),
        project_id: r.get("project_id"),
        name: r.get("name"),
        keywords,
        target_image_count: crate::numeric::i64_to_u32(r.get("target_image_count"))?,
        priority: crate::numeric::i64_to_u8(r.get("priority"))?,
        status,
        progress: crate::numeric::i64_to_u8(r.get("progress"))?,
        downloaded_images: crate::numeric::i64_to_u64(r.get("downloaded_images"))?,
        valid_images: crate::numeric::i64_to_u64(r.get("valid_images"))?,
        duplicate_images: crate::numeric::i64_to_u64(r.get("duplicate_images"))?,
        failed_images: crate::numeric::i64_to_u64(r.get("failed_images"))?,
        total_chunks: crate::numeric::i64_to_u32(r.get("total_chunks"))?,
        active_chunks: crate::numeric::i64_to_u32(r.get("active_chunks"))?,
        completed_chunks: crate::numeric::i64_to_u32(r.get("completed_chunks"))?,
        failed_chunks: crate::numeric::i64_to_u32(r.get("failed_chunks"))?,
        task_ids,
        created_at: parse_ts(r.get("created_at"))?,
        updated_at: parse_ts(r.get("updated_at"))?,
        started_at: parse_ts_opt(r.try_get("started_at").ok())?,
        completed_at: parse_ts_opt(r.try_get("completed_at").ok())?,
    })
}

fn parse_ts(s: String) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::external(format!("corrupt timestamp {s}: {e}")))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, CoreError> {
    match s {
        None => Ok(None),
        Some(s) => parse_ts(s).map(Some),
    }
}

fn row_to_chunk(r: &sqlx::any::AnyRow) -> Result<Chunk, CoreError> {
    let status_s: String = r.get("status");
    let status = ChunkStatus::parse(&status_s)
        .ok_or_else(|| CoreError::external(format!("unrecognized chunk status: {status_s}")))?;
    Ok(Chunk {
        job_id: r.get("job_id"),
        chunk_index: r.get("chunk_index"),
        status,
        priority: crate::numeric::i64_to_u8(r.get("priority"))?,
        range_start: crate::numeric::i64_to_u32(r.get("range_start"))?,
        range_end: crate::numeric::i64_to_u32(r.get("range_end"))?,
        retry_count: crate::numeric::i64_to_u32(r.get("retry_count"))?,
        error_message: r.try_get("error_message").ok(),
        task_id: r.try_get("task_id").ok(),
    })
}

fn row_to_project(r: &sqlx::any::AnyRow) -> Result<Project, CoreError> {
    let owner_s: String = r.get("owner_user_id");
    Ok(Project {
        id: r.get("id"),
        owner_user_id: owner_s
            .parse()
            .map_err(|e| CoreError::external(format!("corrupt owner_user_id: {e}")))?,
        name: r.get("name"),
        created_at: parse_ts(r.get("created_at"))?,
    })
}

#[async_trait]
impl Repository for SqlxRepository {
    async fn begin(&self) -> Result<Tx, CoreError> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Tx) -> Result<(), CoreError> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Tx) -> Result<(), CoreError> {
        tx.rollback().await?;
        Ok(())
    }

    async fn create_project(&self, owner: UserId, name: &str) -> Result<Project, CoreError> {
        let mut tx = self.pool.begin().await?;
        let id = alloc_id_tx(&mut tx, "project").await?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO projects (id, owner_user_id, name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(owner.to_string())
        .bind(name)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Project {
            id,
            owner_user_id: owner,
            name: name.to_string(),
            created_at: parse_ts(now)?,
        })
    }

    async fn get_project(&self, project_id: ProjectId) -> Result<Option<Project>, CoreError> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_project).transpose()
    }

    async fn create_job(&self, tx: &mut Tx, new_job: NewJob) -> Result<Job, CoreError> {
        let id = alloc_id_tx(tx, "job").await?;
        let project = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(new_job.project_id)
            .fetch_optional(&mut **tx)
            .await?
            .map(|r| row_to_project(&r))
            .transpose()?
            .ok_or(CoreError::NotFound)?;
        let now = Utc::now().to_rfc3339();
        let keywords_s = serde_json::to_string(&new_job.keywords)
            .map_err(|e| CoreError::external(e.to_string()))?;

        sqlx::query(
            r#"
INSERT INTO jobs (
  id, project_id, owner_user_id, name, keywords, target_image_count, priority,
  status, progress, downloaded_images, valid_images, duplicate_images, failed_images,
  total_chunks, active_chunks, completed_chunks, failed_chunks, task_ids,
  created_at, updated_at, started_at, completed_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, 0, 0, 0, 0, 0, 0, '[]', ?, ?, NULL, NULL);
"#,
        )
        .bind(id)
        .bind(new_job.project_id)
        .bind(project.owner_user_id.to_string())
        .bind(&new_job.name)
        .bind(&keywords_s)
        .bind(new_job.target_image_count as i64)
        .bind(new_job.priority as i64)
        .bind(JobStatus::Pending.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await?;

        Ok(Job {
            id,
            project_id: new_job.project_id,
            name: new_job.name,
            keywords: new_job.keywords,
            target_image_count: new_job.target_image_count,
            priority: new_job.priority,
            status: JobStatus::Pending,
            progress: 0,
            downloaded_images: 0,
            valid_images: 0,
            duplicate_images: 0,
            failed_images: 0,
            total_chunks: 0,
            active_chunks: 0,
            completed_chunks: 0,
            failed_chunks: 0,
            task_ids: Vec::new(),
            created_at: parse_ts(now.clone())?,
            updated_at: parse_ts(now)?,
            started_at: None,
            completed_at: None,
        })
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, CoreError> {
        let row = warn_if_slow("db_fetch_job_by_id", Duration::from_millis(100), async {
            sqlx::query("SELECT * FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
        })
        .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn get_job_for_update(
        &self,
        tx: &mut Tx,
        job_id: JobId,
    ) -> Result<Option<Job>, CoreError> {
        // `sqlx::Any` has no portable `SELECT ... FOR UPDATE`; the exclusive lock this
        // primitive promises comes from serializing on a guarded self-update instead, the
        // same CAS discipline the rest of this layer uses for every other mutation.
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&mut **tx)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let job = row_to_job(&row)?;

        let res = sqlx::query("UPDATE jobs SET updated_at = updated_at WHERE id = ? AND status = ?")
            .bind(job_id)
            .bind(job.status.as_str())
            .execute(&mut **tx)
            .await?;
        if res.rows_affected() != 1 {
            // Status changed between the read and the lock-acquiring update; re-read once.
            let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&mut **tx)
                .await?;
            return row.as_ref().map(row_to_job).transpose();
        }
        Ok(Some(job))
    }

    async fn update_job(&self, tx: &mut Tx, job: &Job) -> Result<(), CoreError> {
        let keywords_s = serde_json::to_string(&job.keywords)
            .map_err(|e| CoreError::external(e.to_string()))?;
        let task_ids_s = serde_json::to_string(&job.task_ids)
            .map_err(|e| CoreError::external(e.to_string()))?;
        sqlx::query(
            r#"
UPDATE jobs SET
  name = ?, keywords = ?, target_image_count = ?, priority = ?, status = ?, progress = ?,
  downloaded_images = ?, valid_images = ?, duplicate_images = ?, failed_images = ?,
  total_chunks = ?, active_chunks = ?, completed_chunks = ?, failed_chunks = ?,
  task_ids = ?, updated_at = ?, started_at = ?, completed_at = ?
WHERE id = ?;
"#,
        )
        .bind(&job.name)
        .bind(&keywords_s)
        .bind(job.target_image_count as i64)
        .bind(job.priority as i64)
        .bind(job.status.as_str())
        .bind(job.progress as i64)
        .bind(job.downloaded_images as i64)
        .bind(job.valid_images as i64)
        .bind(job.duplicate_images as i64)
        .bind(job.failed_images as i64)
        .bind(job.total_chunks as i64)
        .bind(job.active_chunks as i64)
        .bind(job.completed_chunks as i64)
        .bind(job.failed_chunks as i64)
        .bind(&task_ids_s)
        .bind(Utc::now().to_rfc3339())
        .bind(job.started_at.map(|d| d.to_rfc3339()))
        .bind(job.completed_at.map(|d| d.to_rfc3339()))
        .bind(job.id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn list_jobs_by_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, CoreError> {
        let rows = warn_if_slow("db_load_jobs_page", Duration::from_millis(200), async {
            sqlx::query("SELECT * FROM jobs WHERE owner_user_id = ? ORDER BY id DESC LIMIT ? OFFSET ?")
                .bind(user_id.to_string())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
        })
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn list_chunks_for_job(&self, job_id: JobId) -> Result<Vec<Chunk>, CoreError> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE job_id = ? ORDER BY chunk_index ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn get_chunk(
        &self,
        tx: &mut Tx,
        job_id: JobId,
        chunk_index: ChunkIndex,
    ) -> Result<Option<Chunk>, CoreError> {
        let row = sqlx::query("SELECT * FROM chunks WHERE job_id = ? AND chunk_index = ?")
            .bind(job_id)
            .bind(chunk_index)
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(row_to_chunk).transpose()
    }

    async fn bulk_create_chunks(&self, tx: &mut Tx, records: &[NewChunk]) -> Result<(), CoreError> {
        for c in records {
            sqlx::query(
                r#"
INSERT INTO chunks (job_id, chunk_index, status, priority, range_start, range_end, retry_count, error_message, task_id)
VALUES (?, ?, ?, ?, ?, ?, 0, NULL, NULL);
"#,
            )
            .bind(c.job_id)
            .bind(c.chunk_index)
            .bind(ChunkStatus::Pending.as_str())
            .bind(c.priority as i64)
            .bind(c.range_start as i64)
            .bind(c.range_end as i64)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn delete_chunks_for_job(&self, tx: &mut Tx, job_id: JobId) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM images WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn update_chunk(&self, tx: &mut Tx, chunk: &Chunk) -> Result<(), CoreError> {
        sqlx::query(
            r#"
UPDATE chunks SET status = ?, priority = ?, range_start = ?, range_end = ?, retry_count = ?,
  error_message = ?, task_id = ?
WHERE job_id = ? AND chunk_index = ?;
"#,
        )
        .bind(chunk.status.as_str())
        .bind(chunk.priority as i64)
        .bind(chunk.range_start as i64)
        .bind(chunk.range_end as i64)
        .bind(chunk.retry_count as i64)
        .bind(&chunk.error_message)
        .bind(&chunk.task_id)
        .bind(chunk.job_id)
        .bind(chunk.chunk_index)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn bulk_insert_images(&self, tx: &mut Tx, records: &[NewImage]) -> Result<(), CoreError> {
        for img in records {
            let id = alloc_id_tx(tx, "image").await?;
            let content_s = img
                .content_metadata
                .as_ref()
                .map(|v| v.to_string());
            let validation_s = img
                .validation_metadata
                .as_ref()
                .map(|v| v.to_string());
            sqlx::query(
                r#"
INSERT INTO images (id, job_id, chunk_index, source_url, filename, storage_key, content_metadata, is_valid, is_duplicate, validation_metadata)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
"#,
            )
            .bind(id)
            .bind(img.job_id)
            .bind(img.chunk_index)
            .bind(&img.source_url)
            .bind(&img.filename)
            .bind(&img.storage_key)
            .bind(content_s)
            .bind(img.is_valid as i64)
            .bind(img.is_duplicate as i64)
            .bind(validation_s)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn append_activity(&self, entry: NewActivity) -> Result<(), CoreError> {
        let id = alloc_id_pool(&self.pool, "activity").await?;
        sqlx::query(
            r#"
INSERT INTO activity (id, user_id, action, subject_type, subject_id, metadata, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?);
"#,
        )
        .bind(id)
        .bind(entry.user_id.to_string())
        .bind(&entry.action)
        .bind(&entry.subject_type)
        .bind(&entry.subject_id)
        .bind(entry.metadata.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sum_active_chunks_across_all_jobs(&self) -> Result<i64, CoreError> {
        let row = sqlx::query("SELECT COALESCE(SUM(active_chunks), 0) AS total FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }

    async fn count_concurrent_jobs(&self, user_id: UserId) -> Result<i64, CoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM jobs WHERE owner_user_id = ? AND status IN ('pending', 'running')",
        )
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    async fn count_jobs_today(&self, user_id: UserId) -> Result<i64, CoreError> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc();
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE owner_user_id = ? AND created_at >= ?")
            .bind(user_id.to_string())
            .bind(midnight.to_rfc3339())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn count_projects(&self, user_id: UserId) -> Result<i64, CoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM projects WHERE owner_user_id = ?")
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn count_team_members(&self, project_id: ProjectId) -> Result<i64, CoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM team_members WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn list_active_job_ids(&self) -> Result<Vec<JobId>, CoreError> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE status IN ('pending', 'running', 'cancelling')")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn list_old_failed_job_ids(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, CoreError> {
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE status IN ('failed', 'cancelled') AND updated_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn list_activity_for_subject(
        &self,
        subject_type: &str,
        subject_id: &str,
    ) -> Result<Vec<Activity>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM activity WHERE subject_type = ? AND subject_id = ? ORDER BY id ASC",
        )
        .bind(subject_type)
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let user_s: String = r.get("user_id");
                let metadata_s: String = r.get("metadata");
                Ok(Activity {
                    id: r.get("id"),
                    user_id: user_s
                        .parse()
                        .map_err(|e| CoreError::external(format!("corrupt user_id: {e}")))?,
                    action: r.get("action"),
                    subject_type: r.get("subject_type"),
                    subject_id: r.get("subject_id"),
                    metadata: serde_json::from_str(&metadata_s).unwrap_or(serde_json::Value::Null),
                    created_at: parse_ts(r.get("created_at"))?,
                })
            })
            .collect()
    }
}
