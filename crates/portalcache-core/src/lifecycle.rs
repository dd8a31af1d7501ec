//! Install, activate, periodic sync and client messages.

use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, WorkerError};
use crate::http::{CacheKey, Method, Request, Response};
use crate::store::stamp_store_timestamp;
use crate::sweeper::SweepOutcome;
use crate::worker::WorkerContext;

/// Where the worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    #[default]
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    /// Install failed; this worker will never control pages.
    Redundant,
}

/// A message posted to the worker by a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    RegisterPeriodicSync,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

pub struct LifecycleCoordinator {
    ctx: Arc<WorkerContext>,
    state: RwLock<WorkerState>,
}

impl LifecycleCoordinator {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self {
            ctx,
            state: RwLock::new(WorkerState::Parsed),
        }
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: WorkerState) {
        debug!(?state, "Worker state changed");
        *self.state.write().await = state;
    }

    /// Precache the offline pages and assets and seed the runtime store's
    /// timestamp. Fails, leaving the worker redundant, if any precache
    /// fetch fails.
    pub async fn install(&self) -> Result<()> {
        self.set_state(WorkerState::Installing).await;

        if let Err(e) = self.ctx.host.skip_waiting().await {
            warn!(error = %e, "skip_waiting failed");
        }

        let (precached, seeded) = tokio::join!(self.precache(), self.seed_runtime_timestamp());
        if let Err(e) = seeded {
            warn!(error = %e, "Failed to seed runtime store timestamp");
        }

        match precached {
            Ok(count) => {
                info!(count, store = %self.ctx.config.static_cache_name(), "Precached assets");
                self.set_state(WorkerState::Installed).await;
                Ok(())
            }
            Err(e) => {
                self.set_state(WorkerState::Redundant).await;
                Err(WorkerError::InstallFailed(e.to_string()))
            }
        }
    }

    /// Fetch every manifest entry, then store them together.
    async fn precache(&self) -> Result<usize> {
        let timeout = self.ctx.config.network_timeout();
        let urls = self
            .ctx
            .config
            .precache_manifest()
            .iter()
            .map(|path| self.ctx.origin.join(path))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let fetches = urls.into_iter().map(|url| async move {
            let request = Request::new(Method::Get, url);
            let response = match tokio::time::timeout(timeout, self.ctx.network.fetch(&request)).await {
                Ok(result) => result?,
                Err(_) => return Err(WorkerError::Timeout(timeout)),
            };
            check_precache_response(&self.ctx, &request, &response)?;
            Ok::<_, WorkerError>((CacheKey::from_url(&request.url), response))
        });
        let entries = try_join_all(fetches).await?;

        let count = entries.len();
        let cache = self.ctx.storage.open(&self.ctx.config.static_cache_name()).await?;
        cache.put_all(entries).await?;
        Ok(count)
    }

    async fn seed_runtime_timestamp(&self) -> Result<()> {
        let cache = self.ctx.storage.open(&self.ctx.config.runtime_cache_name()).await?;
        stamp_store_timestamp(cache.as_ref(), self.ctx.clock.now_ms()).await
    }

    /// Retire old stores, run the sweeper and take control of open pages.
    /// Returns the names of the deleted stores.
    pub async fn activate(&self) -> Result<Vec<String>> {
        self.set_state(WorkerState::Activating).await;

        let now = self.ctx.clock.now_ms();
        let (deleted, swept, claimed) = tokio::join!(
            self.delete_old_caches(),
            self.ctx.sweeper.sweep_logged(self.ctx.storage.as_ref(), now),
            self.ctx.host.claim_clients(),
        );
        debug!(?swept, "Activation sweep finished");
        if let Err(e) = claimed {
            warn!(error = %e, "Failed to claim clients");
        }

        self.set_state(WorkerState::Activated).await;
        deleted
    }

    async fn delete_old_caches(&self) -> Result<Vec<String>> {
        let current = self.ctx.config.current_cache_names();
        let stale: Vec<String> = self
            .ctx
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| !current.contains(name))
            .collect();

        let results = join_all(stale.iter().map(|name| self.ctx.storage.delete(name))).await;
        let mut deleted = Vec::new();
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(true) => {
                    info!(store = %name, "Deleted old store");
                    deleted.push(name);
                }
                Ok(false) => {}
                Err(e) => warn!(store = %name, error = %e, "Failed to delete old store"),
            }
        }
        Ok(deleted)
    }

    /// Run the sweeper for the cleanup tag; ignore any other tag.
    pub async fn on_periodic_sync(&self, tag: &str) -> Option<SweepOutcome> {
        if tag != self.ctx.config.periodic_sync_tag {
            debug!(tag, "Ignoring periodic sync");
            return None;
        }
        self.ctx
            .sweeper
            .sweep_logged(self.ctx.storage.as_ref(), self.ctx.clock.now_ms())
            .await
    }

    /// Handle a page message. Failures are logged, never returned: a page
    /// asking for periodic sync on a platform without it is not an error.
    pub async fn on_message(&self, message: ClientMessage) {
        match message {
            ClientMessage::RegisterPeriodicSync => {
                let tag = &self.ctx.config.periodic_sync_tag;
                let interval = self.ctx.config.periodic_sync_min_interval();
                match self.ctx.host.register_periodic_sync(tag, interval).await {
                    Ok(()) => debug!(tag = %tag, "Periodic sync registered"),
                    Err(WorkerError::Unsupported(what)) => {
                        info!(tag = %tag, "Host has no {}, relying on fetch-triggered sweeps", what)
                    }
                    Err(e) => warn!(tag = %tag, error = %e, "Periodic sync registration failed"),
                }
            }
            ClientMessage::Unknown => debug!("Ignoring unknown client message"),
        }
    }
}

fn check_precache_response(ctx: &WorkerContext, request: &Request, response: &Response) -> Result<()> {
    if !response.is_ok() {
        return Err(WorkerError::from_status(
            response.status,
            request.url.as_str(),
            &response.body,
        ));
    }
    if !ctx.classifier.is_cacheable_response(response, request) {
        return Err(WorkerError::InstallFailed(format!(
            "{} is not cacheable (status {}, {:?})",
            request.url, response.status, response.response_type
        )));
    }
    Ok(())
}
