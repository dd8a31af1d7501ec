//! Directory-backed cache storage.
//!
//! Each store is one JSON document `<name>.json` under the storage root.
//! Writes go to a temporary file that is renamed over the document, and all
//! operations on one storage are serialized by an async lock, so every
//! put/delete is atomic with respect to the others.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Cache, CacheStorage};
use crate::error::{Result, WorkerError};
use crate::http::{CacheKey, Response};

const STORE_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    entries: BTreeMap<String, Response>,
    updated_at: DateTime<Utc>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(WorkerError::Cache(format!("invalid store name: {:?}", name)))
    }
}

fn store_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{}.{}", name, STORE_EXTENSION))
}

async fn load(path: &Path) -> Result<StoreDocument> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            WorkerError::Cache(format!("failed to parse store {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreDocument::default()),
        Err(e) => Err(e.into()),
    }
}

async fn save(path: &Path, doc: &mut StoreDocument) -> Result<()> {
    doc.updated_at = Utc::now();
    let contents = serde_json::to_vec(doc)?;
    let tmp = path.with_extension(format!("{}.tmp", STORE_EXTENSION));
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// One store document on disk.
#[derive(Debug)]
pub struct DiskCache {
    name: String,
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

#[async_trait]
impl Cache for DiskCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, key: &CacheKey) -> Result<Option<Response>> {
        let _guard = self.lock.lock().await;
        let doc = load(&self.path).await?;
        Ok(doc.entries.get(key.as_str()).cloned())
    }

    async fn put(&self, key: &CacheKey, response: Response) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = load(&self.path).await?;
        doc.entries.insert(key.as_str().to_string(), response);
        save(&self.path, &mut doc).await
    }

    async fn put_all(&self, entries: Vec<(CacheKey, Response)>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = load(&self.path).await?;
        for (key, response) in entries {
            doc.entries.insert(key.as_str().to_string(), response);
        }
        // Single rename: either every entry lands or none does
        save(&self.path, &mut doc).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut doc = load(&self.path).await?;
        if doc.entries.remove(key.as_str()).is_none() {
            return Ok(false);
        }
        save(&self.path, &mut doc).await?;
        Ok(true)
    }

    async fn keys(&self) -> Result<Vec<CacheKey>> {
        let _guard = self.lock.lock().await;
        let doc = load(&self.path).await?;
        Ok(doc.entries.keys().map(|k| CacheKey::from(k.as_str())).collect())
    }
}

/// Cache storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct DiskCacheStorage {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl DiskCacheStorage {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: Arc::new(Mutex::new(())),
        })
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>> {
        validate_name(name)?;
        let path = store_path(&self.root, name);
        {
            let _guard = self.lock.lock().await;
            if !tokio::fs::try_exists(&path).await? {
                debug!(store = name, path = %path.display(), "Creating store");
                save(&path, &mut StoreDocument::default()).await?;
            }
        }
        Ok(Arc::new(DiskCache {
            name: name.to_string(),
            path,
            lock: self.lock.clone(),
        }))
    }

    async fn has(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        Ok(tokio::fs::try_exists(store_path(&self.root, name)).await?)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(store_path(&self.root, name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
