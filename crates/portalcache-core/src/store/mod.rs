//! Named key/value blob caches.
//!
//! This module mirrors the host's cache storage: a set of named stores,
//! each mapping a `CacheKey` to a `Response` snapshot. Two backends share the
//! same traits:
//!
//! - `MemoryCacheStorage`: process-local, for tests and embedding
//! - `DiskCacheStorage`: one JSON document per store under a directory
//!
//! The worker uses two stores (`static-<version>` and `runtime-<version>`);
//! the runtime store also holds the reserved `cache-timestamp` entry.

pub mod disk;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, WorkerError};
use crate::http::{CacheKey, Response};

pub use disk::DiskCacheStorage;
pub use memory::MemoryCacheStorage;

/// One named store.
#[async_trait]
pub trait Cache: Send + Sync {
    fn name(&self) -> &str;

    async fn match_request(&self, key: &CacheKey) -> Result<Option<Response>>;

    /// Insert or overwrite one entry.
    async fn put(&self, key: &CacheKey, response: Response) -> Result<()>;

    /// Insert every entry or none of them.
    async fn put_all(&self, entries: Vec<(CacheKey, Response)>) -> Result<()>;

    async fn delete(&self, key: &CacheKey) -> Result<bool>;

    async fn keys(&self) -> Result<Vec<CacheKey>>;
}

/// The set of named stores.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a store, creating it if it doesn't exist.
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>>;

    async fn has(&self, name: &str) -> Result<bool>;

    async fn delete(&self, name: &str) -> Result<bool>;

    /// Names of all existing stores, sorted.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Look `key` up in every store, in name order.
    async fn match_any(&self, key: &CacheKey) -> Result<Option<Response>> {
        for name in self.keys().await? {
            let cache = self.open(&name).await?;
            if let Some(response) = cache.match_request(key).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

// ============================================================================
// Store timestamp entry
// ============================================================================

/// Record `now_ms` as the store's last-swept time.
pub async fn stamp_store_timestamp(cache: &dyn Cache, now_ms: i64) -> Result<()> {
    let entry = Response::text(200, &now_ms.to_string());
    cache.put(&CacheKey::store_timestamp(), entry).await
}

/// The store's last-swept time, if it has been stamped. An unparseable entry
/// is `CorruptTimestamp`.
pub async fn read_store_timestamp(cache: &dyn Cache) -> Result<Option<i64>> {
    match cache.match_request(&CacheKey::store_timestamp()).await? {
        Some(entry) => {
            let text = entry.body_text();
            match text.trim().parse::<i64>() {
                Ok(ts) => Ok(Some(ts)),
                Err(_) => Err(WorkerError::CorruptTimestamp(text)),
            }
        }
        None => Ok(None),
    }
}
