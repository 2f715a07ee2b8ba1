use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::instrument;

use crate::error::CoreError;
use crate::metrics::Counters;
use crate::models::JobId;
use crate::object_store::{ObjectEntry, ObjectStore, StorageStats};
use crate::repository::Repository;

/// Which of the five named production triggers (plus the operator's `Manual` escape hatch,
/// carried over even though the distilled core names only five) asked for a run.
#[derive(Clone, Debug)]
pub enum CleanupTrigger {
    ChunkCompletion { job_id: JobId, chunk_index: i32, files: Vec<String> },
    CrashRecovery { job_id: Option<JobId> },
    Orphaned { max_age_hours: i64 },
    Emergency,
    Scheduled,
    Manual,
}

impl CleanupTrigger {
    fn label(&self) -> &'static str {
        match self {
            CleanupTrigger::ChunkCompletion { .. } => "chunk_completion",
            CleanupTrigger::CrashRecovery { .. } => "crash_recovery",
            CleanupTrigger::Orphaned { .. } => "orphaned",
            CleanupTrigger::Emergency => "emergency",
            CleanupTrigger::Scheduled => "scheduled",
            CleanupTrigger::Manual => "manual",
        }
    }
}

/// Result of one cleanup pass (§4.8 common contract). Individual delete failures never abort
/// a run; they only accumulate in `errors`.
#[derive(Clone, Debug)]
pub struct CleanupStats {
    pub trigger: &'static str,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub files_scanned: u64,
    pub files_deleted: u64,
    pub bytes_freed: u64,
    pub storage_before_percent: f64,
    pub storage_after_percent: f64,
    pub errors: Vec<String>,
}

impl CleanupStats {
    fn new(trigger: &'static str, start: DateTime<Utc>) -> Self {
        Self {
            trigger,
            start,
            end: start,
            files_scanned: 0,
            files_deleted: 0,
            bytes_freed: 0,
            storage_before_percent: 0.0,
            storage_after_percent: 0.0,
            errors: Vec::new(),
        }
    }

    pub fn duration(&self) -> ChronoDuration {
        self.end - self.start
    }
}

/// Reclaims object-store space under the temp-storage prefix (§4.8). Runs concurrently with
/// dispatch and result aggregation without coordination beyond the safety-margin rule below.
pub struct CleanupEngine {
    repo: Arc<dyn Repository>,
    store: Arc<dyn ObjectStore>,
    counters: Arc<Counters>,
    temp_storage_path: String,
    emergency_threshold: f64,
}

impl CleanupEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        store: Arc<dyn ObjectStore>,
        counters: Arc<Counters>,
        temp_storage_path: String,
        emergency_threshold: f64,
    ) -> Self {
        Self {
            repo,
            store,
            counters,
            temp_storage_path,
            emergency_threshold,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self, trigger: CleanupTrigger) -> Result<CleanupStats, CoreError> {
        let start = Utc::now();
        let mut stats = CleanupStats::new(trigger.label(), start);
        stats.storage_before_percent = self.storage_percent().await;

        match trigger {
            CleanupTrigger::ChunkCompletion { job_id, chunk_index, files } => {
                self.chunk_completion(job_id, chunk_index, &files, &mut stats, start)
                    .await?;
            }
            CleanupTrigger::CrashRecovery { job_id } => {
                self.crash_recovery(job_id, &mut stats, start).await?;
            }
            CleanupTrigger::Orphaned { max_age_hours } => {
                self.orphaned(max_age_hours, &mut stats, start).await?;
            }
            CleanupTrigger::Emergency => {
                self.emergency(&mut stats, start).await?;
            }
            CleanupTrigger::Scheduled | CleanupTrigger::Manual => {
                if stats.storage_before_percent >= self.emergency_threshold {
                    self.emergency(&mut stats, start).await?;
                } else {
                    self.orphaned(24, &mut stats, start).await?;
                    self.crash_recovery(None, &mut stats, start).await?;
                }
            }
        }

        stats.storage_after_percent = self.storage_percent().await;
        stats.end = Utc::now();
        self.counters.cleanup_runs.fetch_add(1, Ordering::Relaxed);
        self.counters
            .cleanup_files_deleted
            .fetch_add(stats.files_deleted, Ordering::Relaxed);
        Ok(stats)
    }

    pub async fn get_storage_stats(&self) -> Result<Option<StorageStats>, CoreError> {
        self.store.storage_stats().await
    }

    async fn storage_percent(&self) -> f64 {
        match self.store.storage_stats().await {
            Ok(Some(s)) => s.percent,
            _ => 0.0,
        }
    }

    async fn chunk_completion(
        &self,
        job_id: JobId,
        chunk_index: i32,
        completed_files: &[String],
        stats: &mut CleanupStats,
        run_start: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let prefix = format!("job_{job_id}_chunk_{chunk_index}_");
        let entries = self.store.list(&prefix).await?;
        stats.files_scanned += entries.len() as u64;
        for entry in entries {
            if completed_files.iter().any(|f| entry.key.contains(f.as_str())) {
                self.delete_if_safe(&entry, stats, run_start).await;
            }
        }
        Ok(())
    }

    async fn crash_recovery(
        &self,
        job_id: Option<JobId>,
        stats: &mut CleanupStats,
        run_start: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let job_ids = match job_id {
            Some(id) => vec![id],
            // No age filter in this mode: every job currently in {Failed, Cancelled} qualifies,
            // which `list_old_failed_job_ids` gives us by passing the run's own start time.
            None => self.repo.list_old_failed_job_ids(run_start).await?,
        };
        for id in job_ids {
            let prefix = format!("job_{id}_");
            let entries = self.store.list(&prefix).await?;
            stats.files_scanned += entries.len() as u64;
            for entry in entries {
                self.delete_if_safe(&entry, stats, run_start).await;
            }
        }
        Ok(())
    }

    async fn orphaned(
        &self,
        max_age_hours: i64,
        stats: &mut CleanupStats,
        run_start: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let orphans = self.detect_orphans(max_age_hours, run_start).await?;
        stats.files_scanned += orphans.len() as u64;
        for entry in orphans {
            self.delete_if_safe(&entry, stats, run_start).await;
        }
        Ok(())
    }

    /// Iterative, escalating pass: orphans at a 1-hour age first, then failed-job files, then
    /// oldest-first — each phase re-checks storage usage and stops as soon as it clears
    /// `threshold - 5%`, escalating to `threshold - 10%` only if still above after both earlier
    /// phases (§4.8).
    async fn emergency(&self, stats: &mut CleanupStats, run_start: DateTime<Utc>) -> Result<(), CoreError> {
        if stats.storage_before_percent < self.emergency_threshold {
            return Ok(());
        }
        tracing::warn!(
            usage = stats.storage_before_percent,
            threshold = self.emergency_threshold,
            "emergency cleanup triggered"
        );

        let orphans = self.detect_orphans(1, run_start).await?;
        stats.files_scanned += orphans.len() as u64;
        for entry in orphans {
            self.delete_if_safe(&entry, stats, run_start).await;
            if self.storage_percent().await <= self.emergency_threshold - 5.0 {
                return Ok(());
            }
        }

        if self.storage_percent().await > self.emergency_threshold - 5.0 {
            let failed_ids = self.repo.list_old_failed_job_ids(run_start).await?;
            for id in failed_ids {
                let prefix = format!("job_{id}_");
                let entries = self.store.list(&prefix).await?;
                stats.files_scanned += entries.len() as u64;
                for entry in entries {
                    self.delete_if_safe(&entry, stats, run_start).await;
                    if self.storage_percent().await <= self.emergency_threshold - 5.0 {
                        return Ok(());
                    }
                }
            }
        }

        if self.storage_percent().await > self.emergency_threshold - 5.0 {
            let mut all = self.store.list(&self.temp_storage_path).await?;
            all.sort_by_key(|e| e.modified_at);
            stats.files_scanned += all.len() as u64;
            for entry in all {
                self.delete_if_safe(&entry, stats, run_start).await;
                if self.storage_percent().await <= self.emergency_threshold - 10.0 {
                    break;
                }
            }
        }

        let after = self.storage_percent().await;
        if after >= self.emergency_threshold {
            tracing::error!(usage = after, "emergency cleanup left storage above threshold");
        }
        Ok(())
    }

    /// A file is an orphan iff (a) its name yields no extractable `job_{id}` prefix and its
    /// mtime is older than the cutoff, or (b) the extracted job id is not currently active and
    /// either does not exist or belongs to an old-failed job.
    async fn detect_orphans(
        &self,
        max_age_hours: i64,
        run_start: DateTime<Utc>,
    ) -> Result<Vec<ObjectEntry>, CoreError> {
        let cutoff = run_start - ChronoDuration::hours(max_age_hours);
        let all = self.store.list(&self.temp_storage_path).await?;
        let active: std::collections::HashSet<JobId> =
            self.repo.list_active_job_ids().await?.into_iter().collect();
        let old_failed: std::collections::HashSet<JobId> = self
            .repo
            .list_old_failed_job_ids(cutoff)
            .await?
            .into_iter()
            .collect();

        let mut orphans = Vec::new();
        for entry in all {
            match extract_job_id(&entry.key) {
                None => {
                    if entry.modified_at < cutoff {
                        orphans.push(entry);
                    }
                }
                Some(job_id) => {
                    if !active.contains(&job_id)
                        && (old_failed.contains(&job_id)
                            || self.repo.get_job(job_id).await?.is_none())
                    {
                        orphans.push(entry);
                    }
                }
            }
        }
        Ok(orphans)
    }

    /// Safety margin against races with workers still writing: never delete a file whose
    /// mtime is newer than the run start minus one minute.
    async fn delete_if_safe(&self, entry: &ObjectEntry, stats: &mut CleanupStats, run_start: DateTime<Utc>) {
        if entry.modified_at > run_start - ChronoDuration::minutes(1) {
            return;
        }
        match self.store.delete(&entry.key).await {
            Ok(()) => {
                stats.files_deleted += 1;
                stats.bytes_freed += entry.size_bytes;
            }
            Err(e) => {
                stats.errors.push(format!("{}: {e}", entry.key));
            }
        }
    }
}

/// Runs `CleanupTrigger::Scheduled` on a fixed cadence for the lifetime of the process (§4.8 —
/// "a single ticking background task"). The returned handle is dropped by callers that don't
/// need to join it; aborting the process aborts this task along with everything else.
pub fn spawn_scheduled(engine: Arc<CleanupEngine>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match engine.run(CleanupTrigger::Scheduled).await {
                Ok(stats) => {
                    tracing::info!(
                        files_deleted = stats.files_deleted,
                        bytes_freed = stats.bytes_freed,
                        storage_after_percent = stats.storage_after_percent,
                        "scheduled cleanup pass completed"
                    );
                }
                Err(e) => tracing::error!(error = %e, "scheduled cleanup pass failed"),
            }
        }
    })
}

/// Extracts the numeric id from a `job_{id}_...` style key.
fn extract_job_id(key: &str) -> Option<JobId> {
    let name = key.rsplit('/').next().unwrap_or(key);
    let rest = name.strip_prefix("job_")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
