use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = i64;
pub type ProjectId = i64;
pub type ChunkIndex = i32;
pub type UserId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
            JobStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "cancelling" => Some(JobStatus::Cancelling),
            "cancelled" => Some(JobStatus::Cancelled),
            "failed" => Some(JobStatus::Failed),
            "completed" => Some(JobStatus::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Processing => "processing",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChunkStatus::Pending),
            "processing" => Some(ChunkStatus::Processing),
            "completed" => Some(ChunkStatus::Completed),
            "failed" => Some(ChunkStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A crawl job, owned by exactly one project.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub project_id: ProjectId,
    pub name: String,
    pub keywords: Vec<String>,
    pub target_image_count: u32,
    pub priority: u8,
    pub status: JobStatus,
    pub progress: u8,

    pub downloaded_images: u64,
    pub valid_images: u64,
    pub duplicate_images: u64,
    pub failed_images: u64,

    pub total_chunks: u32,
    pub active_chunks: u32,
    pub completed_chunks: u32,
    pub failed_chunks: u32,

    pub task_ids: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// `active + completed + failed <= total` at all times (testable property #1, as equality
    /// once chunks exist).
    pub fn chunk_counters_consistent(&self) -> bool {
        self.active_chunks + self.completed_chunks + self.failed_chunks <= self.total_chunks
    }
}

#[derive(Clone, Debug)]
pub struct NewJob {
    pub project_id: ProjectId,
    pub name: String,
    pub keywords: Vec<String>,
    pub target_image_count: u32,
    pub priority: u8,
}

/// A fixed-size unit of work within a job, identified by (job_id, chunk_index).
#[derive(Clone, Debug)]
pub struct Chunk {
    pub job_id: JobId,
    pub chunk_index: ChunkIndex,
    pub status: ChunkStatus,
    pub priority: u8,
    pub range_start: u32,
    pub range_end: u32,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub task_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewChunk {
    pub job_id: JobId,
    pub chunk_index: ChunkIndex,
    pub priority: u8,
    pub range_start: u32,
    pub range_end: u32,
}

/// A downloaded image, child of exactly one chunk.
#[derive(Clone, Debug)]
pub struct Image {
    pub id: i64,
    pub job_id: JobId,
    pub chunk_index: ChunkIndex,
    pub source_url: String,
    pub filename: String,
    pub storage_key: Option<String>,
    pub content_metadata: Option<serde_json::Value>,
    pub is_valid: bool,
    pub is_duplicate: bool,
    pub validation_metadata: Option<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct NewImage {
    pub job_id: JobId,
    pub chunk_index: ChunkIndex,
    pub source_url: String,
    pub filename: String,
    pub storage_key: Option<String>,
    pub content_metadata: Option<serde_json::Value>,
    pub is_valid: bool,
    pub is_duplicate: bool,
    pub validation_metadata: Option<serde_json::Value>,
}

/// Append-only audit record. Never rolled back by a failed write (§9).
#[derive(Clone, Debug)]
pub struct NewActivity {
    pub user_id: UserId,
    pub action: String,
    pub subject_type: String,
    pub subject_id: String,
    pub metadata: serde_json::Value,
}

#[derive(Clone, Debug)]
pub struct Activity {
    pub id: i64,
    pub user_id: UserId,
    pub action: String,
    pub subject_type: String,
    pub subject_id: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Project {
    pub id: ProjectId,
    pub owner_user_id: UserId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Snapshot returned by `Status`/`get_progress` — counters, chunk statistics, timestamps.
#[derive(Clone, Debug, Serialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub downloaded_images: u64,
    pub valid_images: u64,
    pub duplicate_images: u64,
    pub failed_images: u64,
    pub total_chunks: u32,
    pub active_chunks: u32,
    pub completed_chunks: u32,
    pub failed_chunks: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobProgress {
    fn from(j: &Job) -> Self {
        Self {
            job_id: j.id,
            status: j.status,
            progress: j.progress,
            downloaded_images: j.downloaded_images,
            valid_images: j.valid_images,
            duplicate_images: j.duplicate_images,
            failed_images: j.failed_images,
            total_chunks: j.total_chunks,
            active_chunks: j.active_chunks,
            completed_chunks: j.completed_chunks,
            failed_chunks: j.failed_chunks,
            created_at: j.created_at,
            started_at: j.started_at,
            completed_at: j.completed_at,
        }
    }
}
