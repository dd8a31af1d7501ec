//! Fakes shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, WorkerError};
use crate::http::{CacheKey, Request, Response};
use crate::network::Network;
use crate::store::{Cache, CacheStorage};

pub const ORIGIN: &str = "https://www.medieteknik.com";

pub fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
}

pub fn get(path: &str) -> Request {
    Request::get(&url(path)).unwrap()
}

pub fn key(path: &str) -> CacheKey {
    CacheKey::from(url(path).as_str())
}

pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

// ============================================================================
// Network
// ============================================================================

/// Network with canned answers per URL. Unknown URLs fail like an offline
/// network.
#[derive(Default)]
pub struct ScriptedNetwork {
    routes: Mutex<HashMap<String, Result<Response>>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, url: &str, response: Response) {
        self.routes.lock().unwrap().insert(url.to_string(), Ok(response));
    }

    pub fn fail(&self, url: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), Err(WorkerError::Network("connection refused".into())));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let url = request.url.as_str().to_string();
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().unwrap().entry(url.clone()).or_default() += 1;

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.routes
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .unwrap_or_else(|| Err(WorkerError::Network(format!("offline: {}", url))))
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Wraps a storage and counts `keys()` calls on every store it opens.
pub struct CountingStorage<S> {
    inner: S,
    pub entry_scans: Arc<AtomicUsize>,
}

impl<S> CountingStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            entry_scans: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn scans(&self) -> usize {
        self.entry_scans.load(Ordering::SeqCst)
    }
}

struct CountingCache {
    inner: Arc<dyn Cache>,
    entry_scans: Arc<AtomicUsize>,
}

#[async_trait]
impl Cache for CountingCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn match_request(&self, key: &CacheKey) -> Result<Option<Response>> {
        self.inner.match_request(key).await
    }

    async fn put(&self, key: &CacheKey, response: Response) -> Result<()> {
        self.inner.put(key, response).await
    }

    async fn put_all(&self, entries: Vec<(CacheKey, Response)>) -> Result<()> {
        self.inner.put_all(entries).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn keys(&self) -> Result<Vec<CacheKey>> {
        self.entry_scans.fetch_add(1, Ordering::SeqCst);
        self.inner.keys().await
    }
}

#[async_trait]
impl<S: CacheStorage> CacheStorage for CountingStorage<S> {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>> {
        let inner = self.inner.open(name).await?;
        Ok(Arc::new(CountingCache {
            inner,
            entry_scans: self.entry_scans.clone(),
        }))
    }

    async fn has(&self, name: &str) -> Result<bool> {
        self.inner.has(name).await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        self.inner.delete(name).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }
}

/// Storage whose every operation fails, for the error paths.
pub struct BrokenStorage;

#[async_trait]
impl CacheStorage for BrokenStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>> {
        Err(WorkerError::Cache(format!("cannot open {}", name)))
    }

    async fn has(&self, _name: &str) -> Result<bool> {
        Err(WorkerError::Cache("broken".into()))
    }

    async fn delete(&self, _name: &str) -> Result<bool> {
        Err(WorkerError::Cache("broken".into()))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Err(WorkerError::Cache("broken".into()))
    }
}
