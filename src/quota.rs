use std::sync::Arc;

use tracing::{field, instrument};

use crate::error::{CoreError, Tier};
use crate::metrics::Counters;
use crate::models::{ProjectId, UserId};
use crate::profile::ProfileProvider;
use crate::repository::Repository;

/// The operation a caller is about to perform, and the parameters relevant to its limits.
/// One variant per quota-bearing request kind.
#[derive(Clone, Debug)]
pub enum RequestKind {
    CreateJob { target_image_count: u32 },
    CreateProject,
    AddTeamMember { project_id: ProjectId },
}

/// Maps tenant -> tier -> numeric limits and performs atomic admission checks against live
/// repository counts.
pub struct QuotaEnforcer {
    repo: Arc<dyn Repository>,
    profiles: Arc<dyn ProfileProvider>,
    counters: Arc<Counters>,
}

impl QuotaEnforcer {
    pub fn new(
        repo: Arc<dyn Repository>,
        profiles: Arc<dyn ProfileProvider>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            repo,
            profiles,
            counters,
        }
    }

    /// Database and profile-service errors cause the check to **fail open** (return Ok) — an
    /// availability-over-correctness trade-off for what is, ultimately, a soft quota (§4.2).
    #[instrument(skip(self), fields(user_id = %user_id, outcome = field::Empty))]
    pub async fn validate(&self, user_id: UserId, kind: RequestKind) -> Result<(), CoreError> {
        let tier = match self.profiles.profile(user_id).await {
            Ok(p) => p.tier,
            Err(e) => {
                tracing::warn!(error = %e, "profile lookup failed; quota check fails open");
                tracing::Span::current().record("outcome", "fail_open_profile_error");
                return Ok(());
            }
        };
        let limits = tier.limits();

        let result = match kind {
            RequestKind::CreateJob { target_image_count } => {
                if target_image_count as i64 > limits.max_images_per_job {
                    self.counters.quota_rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Err(CoreError::QuotaExceeded {
                        tier,
                        limit_name: "max_images_per_job",
                        limit_value: limits.max_images_per_job,
                        current_value: target_image_count as i64,
                    });
                }
                let Some(concurrent) = self.fail_open(self.repo.count_concurrent_jobs(user_id).await) else {
                    return Ok(());
                };
                if concurrent >= limits.max_concurrent_jobs {
                    return Err(CoreError::QuotaExceeded {
                        tier,
                        limit_name: "max_concurrent_jobs",
                        limit_value: limits.max_concurrent_jobs,
                        current_value: concurrent,
                    });
                }
                let Some(today) = self.fail_open(self.repo.count_jobs_today(user_id).await) else {
                    return Ok(());
                };
                if today >= limits.max_jobs_per_day {
                    return Err(CoreError::QuotaExceeded {
                        tier,
                        limit_name: "max_jobs_per_day",
                        limit_value: limits.max_jobs_per_day,
                        current_value: today,
                    });
                }
                Ok(())
            }
            RequestKind::CreateProject => {
                let Some(projects) = self.fail_open(self.repo.count_projects(user_id).await) else {
                    return Ok(());
                };
                if projects >= limits.max_projects {
                    return Err(CoreError::QuotaExceeded {
                        tier,
                        limit_name: "max_projects",
                        limit_value: limits.max_projects,
                        current_value: projects,
                    });
                }
                Ok(())
            }
            RequestKind::AddTeamMember { project_id } => {
                let Some(members) = self.fail_open(self.repo.count_team_members(project_id).await) else {
                    return Ok(());
                };
                if members >= limits.max_team_members {
                    return Err(CoreError::QuotaExceeded {
                        tier,
                        limit_name: "max_team_members",
                        limit_value: limits.max_team_members,
                        current_value: members,
                    });
                }
                Ok(())
            }
        };

        if result.is_err() {
            self.counters
                .quota_rejected
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        result
    }

    fn fail_open(&self, res: Result<i64, CoreError>) -> Option<i64> {
        match res {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "repository error during quota check; failing open");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::profile::UserProfile;
    use crate::repository::Tx;
    use crate::models::*;
    use chrono::{DateTime, Utc};

    struct StubProfiles {
        tier: Tier,
        fail: bool,
    }

    #[async_trait]
    impl ProfileProvider for StubProfiles {
        async fn verify(&self, _token: &str) -> Result<UserId, CoreError> {
            unimplemented!()
        }
        async fn profile(&self, _user_id: UserId) -> Result<UserProfile, CoreError> {
            if self.fail {
                return Err(CoreError::external("profile unreachable"));
            }
            Ok(UserProfile {
                role: "member".into(),
                tier: self.tier,
            })
        }
    }

    struct StubRepo {
        concurrent_jobs: AtomicI64,
        jobs_today: AtomicI64,
        projects: AtomicI64,
        team_members: AtomicI64,
        fail: bool,
    }

    impl Default for StubRepo {
        fn default() -> Self {
            Self {
                concurrent_jobs: AtomicI64::new(0),
                jobs_today: AtomicI64::new(0),
                projects: AtomicI64::new(0),
                team_members: AtomicI64::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Repository for StubRepo {
        async fn begin(&self) -> Result<Tx, CoreError> {
            unimplemented!()
        }
        async fn commit(&self, _tx: Tx) -> Result<(), CoreError> {
            unimplemented!()
        }
        async fn rollback(&self, _tx: Tx) -> Result<(), CoreError> {
            unimplemented!()
        }
        async fn create_project(&self, _owner: UserId, _name: &str) -> Result<Project, CoreError> {
            unimplemented!()
        }
        async fn get_project(&self, _project_id: ProjectId) -> Result<Option<Project>, CoreError> {
            unimplemented!()
        }
        async fn create_job(&self, _tx: &mut Tx, _new_job: NewJob) -> Result<Job, CoreError> {
            unimplemented!()
        }
        async fn get_job(&self, _job_id: JobId) -> Result<Option<Job>, CoreError> {
            unimplemented!()
        }
        async fn get_job_for_update(&self, _tx: &mut Tx, _job_id: JobId) -> Result<Option<Job>, CoreError> {
            unimplemented!()
        }
        async fn update_job(&self, _tx: &mut Tx, _job: &Job) -> Result<(), CoreError> {
            unimplemented!()
        }
        async fn list_jobs_by_user(&self, _user_id: UserId, _limit: i64, _offset: i64) -> Result<Vec<Job>, CoreError> {
            unimplemented!()
        }
        async fn list_chunks_for_job(&self, _job_id: JobId) -> Result<Vec<Chunk>, CoreError> {
            unimplemented!()
        }
        async fn get_chunk(&self, _tx: &mut Tx, _job_id: JobId, _chunk_index: ChunkIndex) -> Result<Option<Chunk>, CoreError> {
            unimplemented!()
        }
        async fn bulk_create_chunks(&self, _tx: &mut Tx, _records: &[NewChunk]) -> Result<(), CoreError> {
            unimplemented!()
        }
        async fn delete_chunks_for_job(&self, _tx: &mut Tx, _job_id: JobId) -> Result<(), CoreError> {
            unimplemented!()
        }
        async fn update_chunk(&self, _tx: &mut Tx, _chunk: &Chunk) -> Result<(), CoreError> {
            unimplemented!()
        }
        async fn bulk_insert_images(&self, _tx: &mut Tx, _records: &[NewImage]) -> Result<(), CoreError> {
            unimplemented!()
        }
        async fn append_activity(&self, _entry: NewActivity) -> Result<(), CoreError> {
            unimplemented!()
        }
        async fn sum_active_chunks_across_all_jobs(&self) -> Result<i64, CoreError> {
            unimplemented!()
        }
        async fn count_concurrent_jobs(&self, _user_id: UserId) -> Result<i64, CoreError> {
            if self.fail {
                return Err(CoreError::external("db down"));
            }
            Ok(self.concurrent_jobs.load(Ordering::Relaxed))
        }
        async fn count_jobs_today(&self, _user_id: UserId) -> Result<i64, CoreError> {
            Ok(self.jobs_today.load(Ordering::Relaxed))
        }
        async fn count_projects(&self, _user_id: UserId) -> Result<i64, CoreError> {
            Ok(self.projects.load(Ordering::Relaxed))
        }
        async fn count_team_members(&self, _project_id: ProjectId) -> Result<i64, CoreError> {
            Ok(self.team_members.load(Ordering::Relaxed))
        }
        async fn list_active_job_ids(&self) -> Result<Vec<JobId>, CoreError> {
            unimplemented!()
        }
        async fn list_old_failed_job_ids(&self, _cutoff: DateTime<Utc>) -> Result<Vec<JobId>, CoreError> {
            unimplemented!()
        }
        async fn list_activity_for_subject(&self, _subject_type: &str, _subject_id: &str) -> Result<Vec<Activity>, CoreError> {
            unimplemented!()
        }
    }

    fn enforcer(repo: StubRepo, tier: Tier) -> QuotaEnforcer {
        QuotaEnforcer::new(
            Arc::new(repo),
            Arc::new(StubProfiles { tier, fail: false }),
            Arc::new(Counters::default()),
        )
    }

    #[tokio::test]
    async fn s2_free_tier_at_concurrent_limit_is_rejected() {
        let repo = StubRepo {
            concurrent_jobs: AtomicI64::new(1),
            ..Default::default()
        };
        let e = enforcer(repo, Tier::Free);
        let err = e
            .validate(Uuid::new_v4(), RequestKind::CreateJob { target_image_count: 1000 })
            .await
            .unwrap_err();
        match err {
            CoreError::QuotaExceeded { tier, limit_name, limit_value, current_value } => {
                assert_eq!(tier, Tier::Free);
                assert_eq!(limit_name, "max_concurrent_jobs");
                assert_eq!(limit_value, 1);
                assert_eq!(current_value, 1);
            }
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn target_image_count_over_tier_limit_is_rejected_before_counting() {
        let e = enforcer(StubRepo::default(), Tier::Free);
        let err = e
            .validate(Uuid::new_v4(), RequestKind::CreateJob { target_image_count: 5000 })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded { limit_name: "max_images_per_job", .. }));
    }

    #[tokio::test]
    async fn under_every_limit_is_admitted() {
        let e = enforcer(StubRepo::default(), Tier::Pro);
        e.validate(Uuid::new_v4(), RequestKind::CreateJob { target_image_count: 500 })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn repository_error_fails_open() {
        let repo = StubRepo {
            fail: true,
            ..Default::default()
        };
        let e = enforcer(repo, Tier::Free);
        e.validate(Uuid::new_v4(), RequestKind::CreateJob { target_image_count: 50 })
            .await
            .expect("db errors must fail open, not reject");
    }

    #[tokio::test]
    async fn profile_lookup_error_fails_open() {
        let e = QuotaEnforcer::new(
            Arc::new(StubRepo::default()),
            Arc::new(StubProfiles { tier: Tier::Free, fail: true }),
            Arc::new(Counters::default()),
        );
        e.validate(Uuid::new_v4(), RequestKind::CreateJob { target_image_count: 50 })
            .await
            .expect("profile errors must fail open");
    }

    #[tokio::test]
    async fn team_member_limit_enforced_per_project() {
        let repo = StubRepo {
            team_members: AtomicI64::new(1),
            ..Default::default()
        };
        let e = enforcer(repo, Tier::Free);
        let err = e
            .validate(Uuid::new_v4(), RequestKind::AddTeamMember { project_id: 7 })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded { limit_name: "max_team_members", .. }));
    }
}
