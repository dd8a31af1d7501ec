//! The platform the worker runs inside: controlled pages, notifications and
//! background-sync scheduling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, WorkerError};
use crate::notification::Notification;

/// Notification permission as granted by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    Granted,
    Denied,
    #[default]
    Default,
}

/// An open page window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowClient {
    pub id: String,
    pub url: Url,
    pub focused: bool,
    pub controlled: bool,
}

#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Activate this worker without waiting for the previous one to release
    /// its pages.
    async fn skip_waiting(&self) -> Result<()>;

    /// Take control of every open page now.
    async fn claim_clients(&self) -> Result<()>;

    /// Register a periodic background sync. Fails with
    /// `WorkerError::Unsupported` where the platform has none.
    async fn register_periodic_sync(&self, tag: &str, min_interval: Duration) -> Result<()>;

    async fn notification_permission(&self) -> Permission;

    async fn show_notification(&self, notification: Notification) -> Result<()>;

    async fn close_notification(&self, tag: &str) -> Result<()>;

    async fn window_clients(&self) -> Result<Vec<WindowClient>>;

    async fn focus_client(&self, id: &str) -> Result<WindowClient>;

    async fn open_window(&self, url: &Url) -> Result<WindowClient>;
}

// ============================================================================
// Headless host
// ============================================================================

#[derive(Debug, Default)]
struct HostState {
    skipped_waiting: bool,
    claimed: bool,
    periodic_syncs: Vec<(String, Duration)>,
    notifications: Vec<Notification>,
    windows: Vec<WindowClient>,
}

/// In-process host that records what the worker asked of it.
///
/// Used by the command-line driver and the tests.
#[derive(Debug)]
pub struct HeadlessHost {
    permission: Permission,
    periodic_sync_supported: bool,
    next_client_id: AtomicU64,
    state: RwLock<HostState>,
}

impl HeadlessHost {
    pub fn new(permission: Permission, periodic_sync_supported: bool) -> Self {
        Self {
            permission,
            periodic_sync_supported,
            next_client_id: AtomicU64::new(1),
            state: RwLock::new(HostState::default()),
        }
    }

    /// Add an already-open page.
    pub async fn add_window(&self, url: Url) -> WindowClient {
        let client = WindowClient {
            id: self.next_id(),
            url,
            focused: false,
            controlled: false,
        };
        self.state.write().await.windows.push(client.clone());
        client
    }

    fn next_id(&self) -> String {
        format!("client-{}", self.next_client_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn skipped_waiting(&self) -> bool {
        self.state.read().await.skipped_waiting
    }

    pub async fn claimed(&self) -> bool {
        self.state.read().await.claimed
    }

    pub async fn periodic_syncs(&self) -> Vec<(String, Duration)> {
        self.state.read().await.periodic_syncs.clone()
    }

    /// Notifications currently shown.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.read().await.notifications.clone()
    }

    pub async fn windows(&self) -> Vec<WindowClient> {
        self.state.read().await.windows.clone()
    }
}

impl Default for HeadlessHost {
    fn default() -> Self {
        Self::new(Permission::Granted, true)
    }
}

#[async_trait]
impl WorkerHost for HeadlessHost {
    async fn skip_waiting(&self) -> Result<()> {
        self.state.write().await.skipped_waiting = true;
        debug!("skip_waiting");
        Ok(())
    }

    async fn claim_clients(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.claimed = true;
        for window in &mut state.windows {
            window.controlled = true;
        }
        debug!(clients = state.windows.len(), "Claimed clients");
        Ok(())
    }

    async fn register_periodic_sync(&self, tag: &str, min_interval: Duration) -> Result<()> {
        if !self.periodic_sync_supported {
            return Err(WorkerError::Unsupported("periodic background sync".to_string()));
        }
        let mut state = self.state.write().await;
        state.periodic_syncs.retain(|(t, _)| t != tag);
        state.periodic_syncs.push((tag.to_string(), min_interval));
        info!(tag, min_interval_secs = min_interval.as_secs(), "Registered periodic sync");
        Ok(())
    }

    async fn notification_permission(&self) -> Permission {
        self.permission
    }

    async fn show_notification(&self, notification: Notification) -> Result<()> {
        info!(title = %notification.title, tag = %notification.options.tag, "Showing notification");
        let mut state = self.state.write().await;
        // Same tag replaces the previous notification
        state
            .notifications
            .retain(|n| n.options.tag != notification.options.tag);
        state.notifications.push(notification);
        Ok(())
    }

    async fn close_notification(&self, tag: &str) -> Result<()> {
        self.state
            .write()
            .await
            .notifications
            .retain(|n| n.options.tag != tag);
        Ok(())
    }

    async fn window_clients(&self) -> Result<Vec<WindowClient>> {
        Ok(self.state.read().await.windows.clone())
    }

    async fn focus_client(&self, id: &str) -> Result<WindowClient> {
        let mut state = self.state.write().await;
        if !state.windows.iter().any(|w| w.id == id) {
            return Err(WorkerError::InvalidRequest(format!("no such client: {}", id)));
        }
        let mut focused = None;
        for window in &mut state.windows {
            window.focused = window.id == id;
            if window.focused {
                focused = Some(window.clone());
            }
        }
        focused.ok_or_else(|| WorkerError::InvalidRequest(format!("no such client: {}", id)))
    }

    async fn open_window(&self, url: &Url) -> Result<WindowClient> {
        let client = WindowClient {
            id: self.next_id(),
            url: url.clone(),
            focused: true,
            controlled: true,
        };
        let mut state = self.state.write().await;
        for window in &mut state.windows {
            window.focused = false;
        }
        state.windows.push(client.clone());
        info!(url = %url, "Opened window");
        Ok(client)
    }
}
