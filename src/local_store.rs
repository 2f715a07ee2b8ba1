use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::object_store::{ObjectEntry, ObjectStore, StorageStats};

/// Local-filesystem `ObjectStore`, the only concrete backend this crate ships (§6 — production
/// deployments are expected to bring an S3/GCS-backed implementation of the same trait).
/// Keys are relative paths under `base_dir`; `storage_stats` falls back to disk block counting
/// since there is no bucket-level usage API to ask.
pub struct LocalFsObjectStore {
    base_dir: PathBuf,
    total_bytes: u64,
}

impl LocalFsObjectStore {
    pub fn new(base_dir: impl Into<PathBuf>, total_bytes: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            total_bytes,
        }
    }

    fn full_path(&self, key: &str) -> Result<PathBuf, CoreError> {
        if key.contains("..") {
            return Err(CoreError::invalid("object key must not contain '..'"));
        }
        Ok(self.base_dir.join(key))
    }

    async fn walk(dir: PathBuf, prefix: String, out: &mut Vec<ObjectEntry>) -> Result<(), CoreError> {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CoreError::external(e.to_string())),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::external(e.to_string()))?
        {
            let path = entry.path();
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| CoreError::external(e.to_string()))?;

            let name = entry.file_name().to_string_lossy().to_string();
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };

            if metadata.is_dir() {
                Box::pin(Self::walk(path, key, out)).await?;
                continue;
            }

            let modified_at: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            out.push(ObjectEntry {
                key,
                size_bytes: metadata.len(),
                modified_at,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CoreError> {
        let path = self.full_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::external(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| CoreError::external(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CoreError> {
        let path = self.full_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CoreError::NotFound),
            Err(e) => Err(CoreError::external(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        let path = self.full_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::external(e.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, CoreError> {
        let mut out = Vec::new();
        Self::walk(self.base_dir.clone(), String::new(), &mut out).await?;
        Ok(out.into_iter().filter(|e| e.key.starts_with(prefix)).collect())
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, CoreError> {
        let path = self.full_path(key)?;
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        Ok(format!(
            "file://{}?expires_at={}",
            path.display(),
            expires_at.timestamp()
        ))
    }

    async fn storage_stats(&self) -> Result<Option<StorageStats>, CoreError> {
        let mut entries = Vec::new();
        Self::walk(self.base_dir.clone(), String::new(), &mut entries).await?;
        let used_bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();
        let percent = if self.total_bytes == 0 {
            0.0
        } else {
            (used_bytes as f64 / self.total_bytes as f64) * 100.0
        };
        Ok(Some(StorageStats {
            used_bytes,
            total_bytes: self.total_bytes,
            percent,
        }))
    }
}

#[allow(dead_code)]
fn is_within(base: &Path, candidate: &Path) -> bool {
    candidate.starts_with(base)
}
