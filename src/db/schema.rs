use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS projects (
  id BIGINT PRIMARY KEY,
  owner_user_id TEXT NOT NULL,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS team_members (
  project_id BIGINT NOT NULL,
  user_id TEXT NOT NULL,
  PRIMARY KEY (project_id, user_id)
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS jobs (
  id BIGINT PRIMARY KEY,
  project_id BIGINT NOT NULL,
  owner_user_id TEXT NOT NULL,
  name TEXT NOT NULL,
  keywords TEXT NOT NULL,
  target_image_count BIGINT NOT NULL,
  priority BIGINT NOT NULL,
  status TEXT NOT NULL,
  progress BIGINT NOT NULL,

  downloaded_images BIGINT NOT NULL,
  valid_images BIGINT NOT NULL,
  duplicate_images BIGINT NOT NULL,
  failed_images BIGINT NOT NULL,

  total_chunks BIGINT NOT NULL,
  active_chunks BIGINT NOT NULL,
  completed_chunks BIGINT NOT NULL,
  failed_chunks BIGINT NOT NULL,

  task_ids TEXT NOT NULL,

  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  started_at TEXT,
  completed_at TEXT
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS chunks (
  job_id BIGINT NOT NULL,
  chunk_index BIGINT NOT NULL,
  status TEXT NOT NULL,
  priority BIGINT NOT NULL,
  range_start BIGINT NOT NULL,
  range_end BIGINT NOT NULL,
  retry_count BIGINT NOT NULL,
  error_message TEXT,
  task_id TEXT,
  PRIMARY KEY (job_id, chunk_index)
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS images (
  id BIGINT PRIMARY KEY,
  job_id BIGINT NOT NULL,
  chunk_index BIGINT NOT NULL,
  source_url TEXT NOT NULL,
  filename TEXT NOT NULL,
  storage_key TEXT,
  content_metadata TEXT,
  is_valid BIGINT NOT NULL,
  is_duplicate BIGINT NOT NULL,
  validation_metadata TEXT
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS activity (
  id BIGINT PRIMARY KEY,
  user_id TEXT NOT NULL,
  action TEXT NOT NULL,
  subject_type TEXT NOT NULL,
  subject_id TEXT NOT NULL,
  metadata TEXT NOT NULL,
  created_at TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Single-row monotonic id allocators, CAS-incremented under a transaction via a guarded
    // `WHERE` clause rather than a database-specific autoincrement/sequence construct, so the
    // same schema works unchanged against both the postgres and the sqlite backend behind `AnyPool`.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS id_counters (
  name TEXT PRIMARY KEY,
  next_value BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    for name in ["project", "job", "image", "activity"] {
        sqlx::query(
            r#"INSERT INTO id_counters (name, next_value) SELECT ?, 1
                WHERE NOT EXISTS (SELECT 1 FROM id_counters WHERE name = ?)"#,
        )
        .bind(name)
        .bind(name)
        .execute(pool)
        .await?;
    }

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_user_id);"#)
        .execute(pool)
        .await?;
    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id);"#)
        .execute(pool)
        .await?;
    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);"#)
        .execute(pool)
        .await?;
    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_chunks_job ON chunks(job_id);"#)
        .execute(pool)
        .await?;
    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_images_job_chunk ON images(job_id, chunk_index);"#)
        .execute(pool)
        .await?;
    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_activity_subject ON activity(subject_type, subject_id);"#,
    )
    .execute(pool)
    .await?;
    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_team_members_project ON team_members(project_id);"#)
        .execute(pool)
        .await?;

    Ok(())
}
