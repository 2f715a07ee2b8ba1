use crate::error::Tier;

/// Static per-tier numeric limits (§3 Tier limits table). Not persisted; looked up by name.
#[derive(Clone, Copy, Debug)]
pub struct TierLimits {
    pub max_concurrent_jobs: i64,
    pub max_images_per_job: i64,
    pub max_jobs_per_day: i64,
    pub max_projects: i64,
    pub max_team_members: i64,
}

const FREE: TierLimits = TierLimits {
    max_concurrent_jobs: 1,
    max_images_per_job: 100,
    max_jobs_per_day: 3,
    max_projects: 3,
    max_team_members: 1,
};

const PRO: TierLimits = TierLimits {
    max_concurrent_jobs: 3,
    max_images_per_job: 1000,
    max_jobs_per_day: 20,
    max_projects: 10,
    max_team_members: 5,
};

const ENTERPRISE: TierLimits = TierLimits {
    max_concurrent_jobs: 10,
    max_images_per_job: 10_000,
    max_jobs_per_day: 1000,
    max_projects: 100,
    max_team_members: 50,
};

impl Tier {
    /// Case-insensitive; unrecognized names fall back to Free, mirroring the upstream
    /// profile service's own fallback.
    pub fn resolve(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "PRO" => Tier::Pro,
            "ENTERPRISE" => Tier::Enterprise,
            _ => Tier::Free,
        }
    }

    pub fn limits(&self) -> TierLimits {
        match self {
            Tier::Free => FREE,
            Tier::Pro => PRO,
            Tier::Enterprise => ENTERPRISE,
        }
    }
}
