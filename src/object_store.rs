use async_trait::async_trait;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// One entry under a listed prefix — enough for the cleanup engine to apply its age and
/// size accounting without a second round-trip per file.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    pub key: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// Used-vs-total snapshot independent of running a cleanup pass (§4.8 `get_storage_stats`).
#[derive(Clone, Copy, Debug)]
pub struct StorageStats {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
}

/// The pluggable artifact store (§6). Keys are `/`-separated UTF-8 strings up to 500 bytes.
/// Delete failures are logged and counted by the cleanup engine, never fatal.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CoreError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, CoreError>;
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, CoreError>;

    /// Native usage stats, when the backend exposes them. `None` tells the cleanup engine to
    /// fall back to local-filesystem block math (§6, §4.8).
    async fn storage_stats(&self) -> Result<Option<StorageStats>, CoreError>;
}
