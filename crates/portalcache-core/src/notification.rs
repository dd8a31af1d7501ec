//! Push messages and notification clicks.
//!
//! A push payload is an optional JSON object; every field falls back to the
//! configured default, and a payload that isn't valid JSON is treated as an
//! empty one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::clock::Clock;
use crate::config::NotificationDefaults;
use crate::error::Result;
use crate::host::{Permission, WindowClient, WorkerHost};

const DEFAULT_PRIMARY_KEY: i64 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushData {
    pub date_of_arrival: Option<i64>,
    pub primary_key: Option<serde_json::Value>,
    pub url: Option<String>,
}

/// Push message body as sent by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub tag: Option<String>,
    pub require_interaction: Option<bool>,
    pub vibrate: Option<Vec<u32>>,
    pub data: Option<PushData>,
    pub url: Option<String>,
}

impl PushPayload {
    /// Parse push data. Never fails: missing or malformed data yields an
    /// empty payload.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(bytes) = data else {
            return Self::default();
        };
        match serde_json::from_slice(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Push payload is not valid JSON, using defaults");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub date_of_arrival: i64,
    pub primary_key: serde_json::Value,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub require_interaction: bool,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
}

/// A system notification, as handed to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub options: NotificationOptions,
}

impl Notification {
    /// Merge `payload` over `defaults`.
    pub fn from_payload(payload: PushPayload, defaults: &NotificationDefaults, now_ms: i64) -> Self {
        let data = payload.data.unwrap_or_default();
        Self {
            title: payload.title.unwrap_or_else(|| defaults.title.clone()),
            options: NotificationOptions {
                body: payload.body.unwrap_or_else(|| defaults.body.clone()),
                icon: payload.icon.unwrap_or_else(|| defaults.icon.clone()),
                badge: payload.badge.unwrap_or_else(|| defaults.badge.clone()),
                tag: payload.tag.unwrap_or_else(|| defaults.tag.clone()),
                require_interaction: payload
                    .require_interaction
                    .unwrap_or(defaults.require_interaction),
                vibrate: payload.vibrate.unwrap_or_else(|| defaults.vibrate.clone()),
                data: NotificationData {
                    date_of_arrival: data.date_of_arrival.unwrap_or(now_ms),
                    primary_key: data
                        .primary_key
                        .unwrap_or_else(|| DEFAULT_PRIMARY_KEY.into()),
                    url: payload.url.or(data.url),
                },
            },
        }
    }
}

pub struct NotificationBridge {
    defaults: NotificationDefaults,
    origin: Url,
    host: Arc<dyn WorkerHost>,
    clock: Arc<dyn Clock>,
}

impl NotificationBridge {
    pub fn new(
        defaults: NotificationDefaults,
        origin: Url,
        host: Arc<dyn WorkerHost>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            defaults,
            origin,
            host,
            clock,
        }
    }

    /// Show a notification for a push message. Returns whether one was shown.
    pub async fn on_push(&self, data: Option<&[u8]>) -> Result<bool> {
        if self.host.notification_permission().await != Permission::Granted {
            debug!("Notification permission not granted, ignoring push");
            return Ok(false);
        }

        let payload = PushPayload::parse(data);
        let notification = Notification::from_payload(payload, &self.defaults, self.clock.now_ms());
        self.host.show_notification(notification).await?;
        Ok(true)
    }

    /// Close the clicked notification and bring up the page it points to.
    ///
    /// With a target URL: focus a window already showing it, or open one.
    /// Without: focus any open window, or open the site root.
    pub async fn on_click(&self, notification: &Notification) -> Result<WindowClient> {
        self.host.close_notification(&notification.options.tag).await?;

        let target = match notification.options.data.url.as_deref() {
            Some(url) => match self.origin.join(url) {
                Ok(target) => Some(target),
                Err(e) => {
                    warn!(url, error = %e, "Ignoring invalid notification URL");
                    None
                }
            },
            None => None,
        };

        let windows = self.host.window_clients().await?;
        match target {
            Some(target) => match windows.iter().find(|w| w.url == target) {
                Some(window) => self.host.focus_client(&window.id).await,
                None => self.host.open_window(&target).await,
            },
            None => match windows.first() {
                Some(window) => self.host.focus_client(&window.id).await,
                None => self.host.open_window(&self.origin).await,
            },
        }
    }
}
