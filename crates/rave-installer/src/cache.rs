//! Key/value stores for JSON records
//!
//! Used by the prerequisite checker to remember passing reports. Records are
//! opaque `serde_json::Value`s; expiry is the caller's concern.

use crate::error::CacheError;
use async_trait::async_trait;
use moka::future::Cache;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Async get/set/remove by string key
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a record
    ///
    /// # Errors
    /// - `CacheError::Io` / `CacheError::Serde` if a stored record is unreadable
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Store a record, replacing any previous one
    ///
    /// # Errors
    /// - `CacheError::Io` / `CacheError::Serde` if the record cannot be written
    async fn set(&self, key: &str, value: Value) -> Result<(), CacheError>;

    /// Remove a record; missing keys are fine
    ///
    /// # Errors
    /// - `CacheError::Io` if removal fails
    async fn remove(&self, key: &str) -> Result<(), CacheError>;
}

/// One JSON file per key under a directory
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    /// Store rooted at `dir` (created on first write)
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        match tokio::fs::read(self.path(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&value)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(key, path = %path.display(), "cache record written");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store on a moka cache
#[derive(Debug, Clone)]
pub struct MemoryCacheStore {
    inner: Cache<String, Value>,
}

impl MemoryCacheStore {
    /// Store holding at most `max_capacity` records
    #[inline]
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::new(max_capacity),
        }
    }

    /// Store whose records also expire after `ttl`
    #[inline]
    #[must_use]
    pub fn with_ttl(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.inner.get(key).await)
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
        self.inner.insert(key.to_string(), value).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.inner.invalidate(key).await;
        Ok(())
    }
}
