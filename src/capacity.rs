use std::sync::Arc;

use tracing::instrument;

use crate::repository::Repository;

/// Stateless over the repository: reports currently-active chunks against a ceiling computed
/// once, at construction, from the resource configuration (§4.4). On repository error, fails
/// **closed** — the opposite of the quota enforcer — because over-admission here risks storage
/// exhaustion.
pub struct CapacityMonitor {
    repo: Arc<dyn Repository>,
    effective_max_chunks: u32,
}

impl CapacityMonitor {
    pub fn new(repo: Arc<dyn Repository>, effective_max_chunks: u32) -> Self {
        Self {
            repo,
            effective_max_chunks,
        }
    }

    pub fn effective_max_chunks(&self) -> u32 {
        self.effective_max_chunks
    }

    #[instrument(skip(self))]
    pub async fn active_count(&self) -> u32 {
        match self.repo.sum_active_chunks_across_all_jobs().await {
            Ok(n) if n >= 0 => n as u32,
            Ok(_) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "capacity check failed closed: repository error");
                self.effective_max_chunks
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn available(&self) -> u32 {
        self.effective_max_chunks
            .saturating_sub(self.active_count().await)
    }

    pub async fn can_admit(&self, k: u32) -> bool {
        self.available().await >= k
    }
}
