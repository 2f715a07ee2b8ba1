use async_trait::async_trait;

use crate::error::{CoreError, Tier};
use crate::models::UserId;

/// Role/tier pair returned by the upstream auth/profile service. Never cached by the core —
/// tier changes take effect on the next quota check (§6).
#[derive(Clone, Debug)]
pub struct UserProfile {
    pub role: String,
    pub tier: Tier,
}

/// `verify`/`profile` consumed only by the quota enforcer (C2). No concrete auth client ships
/// with the core.
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserId, CoreError>;
    async fn profile(&self, user_id: UserId) -> Result<UserProfile, CoreError>;
}
