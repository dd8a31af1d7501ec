//! The worker root: shared context and event dispatch.

use std::sync::Arc;

use tracing::{debug, error};
use url::Url;

use crate::classifier::Classifier;
use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::host::{WindowClient, WorkerHost};
use crate::http::Request;
use crate::interceptor::{FetchInterceptor, FetchOutcome};
use crate::lifecycle::{ClientMessage, LifecycleCoordinator, WorkerState};
use crate::network::Network;
use crate::notification::{Notification, NotificationBridge};
use crate::store::CacheStorage;
use crate::sweeper::{ExpirySweeper, SweepOutcome};
use crate::tasks::BackgroundTasks;

/// Everything the event handlers share.
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub origin: Url,
    pub classifier: Classifier,
    pub storage: Arc<dyn CacheStorage>,
    pub network: Arc<dyn Network>,
    pub host: Arc<dyn WorkerHost>,
    pub clock: Arc<dyn Clock>,
    pub sweeper: ExpirySweeper,
    pub tasks: BackgroundTasks,
}

impl WorkerContext {
    pub fn new(
        config: WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        host: Arc<dyn WorkerHost>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let origin = Url::parse(&config.origin)?;
        let classifier = Classifier::from_config(&config)?;
        let sweeper = ExpirySweeper::new(
            config.runtime_cache_name(),
            config.sweep_interval(),
            config.max_entry_age(),
        );
        Ok(Self {
            config,
            origin,
            classifier,
            storage,
            network,
            host,
            clock,
            sweeper,
            tasks: BackgroundTasks::new(),
        })
    }
}

/// An event delivered by the host.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    /// Raw message data posted by a page.
    Message(Vec<u8>),
    PeriodicSync { tag: String },
    Push { data: Option<Vec<u8>> },
    NotificationClick(Notification),
}

impl WorkerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Install => "install",
            WorkerEvent::Activate => "activate",
            WorkerEvent::Fetch(_) => "fetch",
            WorkerEvent::Message(_) => "message",
            WorkerEvent::PeriodicSync { .. } => "periodicsync",
            WorkerEvent::Push { .. } => "push",
            WorkerEvent::NotificationClick(_) => "notificationclick",
        }
    }
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Installed,
    Activated { deleted_stores: Vec<String> },
    Fetch(FetchOutcome),
    Handled,
    Swept(Option<SweepOutcome>),
    Pushed { shown: bool },
    Navigated(WindowClient),
    /// The handler failed. Already logged.
    Failed(String),
}

pub struct ServiceWorker {
    ctx: Arc<WorkerContext>,
    interceptor: FetchInterceptor,
    lifecycle: LifecycleCoordinator,
    notifications: NotificationBridge,
}

impl ServiceWorker {
    pub fn new(
        config: WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        host: Arc<dyn WorkerHost>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let ctx = Arc::new(WorkerContext::new(config, storage, network, host, clock)?);
        let notifications = NotificationBridge::new(
            ctx.config.notification.clone(),
            ctx.origin.clone(),
            ctx.host.clone(),
            ctx.clock.clone(),
        );
        Ok(Self {
            interceptor: FetchInterceptor::new(ctx.clone()),
            lifecycle: LifecycleCoordinator::new(ctx.clone()),
            notifications,
            ctx,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.ctx.config
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.ctx.storage
    }

    pub async fn state(&self) -> WorkerState {
        self.lifecycle.state().await
    }

    /// Handle one event. Errors never escape: they are logged and reported
    /// as `EventOutcome::Failed`.
    pub async fn dispatch(&self, event: WorkerEvent) -> EventOutcome {
        let name = event.name();
        debug!(event = name, "Dispatching event");

        match self.handle(event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(event = name, error = %e, "Unhandled worker error");
                EventOutcome::Failed(e.to_string())
            }
        }
    }

    async fn handle(&self, event: WorkerEvent) -> Result<EventOutcome> {
        Ok(match event {
            WorkerEvent::Install => {
                self.install().await?;
                EventOutcome::Installed
            }
            WorkerEvent::Activate => EventOutcome::Activated {
                deleted_stores: self.activate().await?,
            },
            WorkerEvent::Fetch(request) => EventOutcome::Fetch(self.fetch(request).await),
            WorkerEvent::Message(data) => {
                self.message(ClientMessage::parse(&data)?).await;
                EventOutcome::Handled
            }
            WorkerEvent::PeriodicSync { tag } => EventOutcome::Swept(self.periodic_sync(&tag).await),
            WorkerEvent::Push { data } => EventOutcome::Pushed {
                shown: self.push(data.as_deref()).await?,
            },
            WorkerEvent::NotificationClick(notification) => {
                EventOutcome::Navigated(self.notification_click(&notification).await?)
            }
        })
    }

    pub async fn install(&self) -> Result<()> {
        self.lifecycle.install().await
    }

    pub async fn activate(&self) -> Result<Vec<String>> {
        self.lifecycle.activate().await
    }

    pub async fn fetch(&self, request: Request) -> FetchOutcome {
        self.interceptor.handle_fetch(request).await
    }

    pub async fn message(&self, message: ClientMessage) {
        self.lifecycle.on_message(message).await
    }

    pub async fn periodic_sync(&self, tag: &str) -> Option<SweepOutcome> {
        self.lifecycle.on_periodic_sync(tag).await
    }

    /// Run the sweeper now, as the periodic cleanup would.
    pub async fn sweep(&self) -> Result<SweepOutcome> {
        self.ctx
            .sweeper
            .maybe_sweep(self.ctx.storage.as_ref(), self.ctx.clock.now_ms())
            .await
    }

    pub async fn push(&self, data: Option<&[u8]>) -> Result<bool> {
        self.notifications.on_push(data).await
    }

    pub async fn notification_click(&self, notification: &Notification) -> Result<WindowClient> {
        self.notifications.on_click(notification).await
    }

    /// Wait for background work started by earlier events.
    pub async fn settle(&self) {
        self.interceptor.settle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::host::HeadlessHost;
    use crate::http::Response;
    use crate::store::MemoryCacheStorage;
    use crate::test_support::{get, url, BrokenStorage, ScriptedNetwork};

    const NOW: i64 = 1_750_000_000_000;

    fn worker(storage: Arc<dyn CacheStorage>, network: Arc<ScriptedNetwork>, host: Arc<HeadlessHost>) -> ServiceWorker {
        ServiceWorker::new(
            WorkerConfig::default(),
            storage,
            network,
            host,
            Arc::new(ManualClock::new(NOW)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_install_activate_then_serve_offline() {
        let network = ScriptedNetwork::new();
        network.respond(&url("/sv/~offline"), Response::ok("Du är offline"));
        network.respond(&url("/en/~offline"), Response::ok("You are offline"));
        network.respond(&url("/images/logo.webp"), Response::ok("webp"));
        let host = Arc::new(HeadlessHost::default());
        let worker = worker(Arc::new(MemoryCacheStorage::new()), network, host.clone());

        assert_eq!(worker.dispatch(WorkerEvent::Install).await, EventOutcome::Installed);
        assert_eq!(
            worker.dispatch(WorkerEvent::Activate).await,
            EventOutcome::Activated { deleted_stores: vec![] }
        );
        assert_eq!(worker.state().await, WorkerState::Activated);
        assert!(host.claimed().await);

        let outcome = worker.dispatch(WorkerEvent::Fetch(get("/sv/events"))).await;
        match outcome {
            EventOutcome::Fetch(FetchOutcome::Respond(response)) => {
                assert_eq!(response.body_text(), "Du är offline")
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        worker.settle().await;
    }

    #[tokio::test]
    async fn test_failures_are_reported_not_propagated() {
        let host = Arc::new(HeadlessHost::default());
        let worker = worker(Arc::new(BrokenStorage), ScriptedNetwork::new(), host);

        assert!(matches!(worker.dispatch(WorkerEvent::Install).await, EventOutcome::Failed(_)));
        assert!(matches!(
            worker.dispatch(WorkerEvent::Message(b"not json".to_vec())).await,
            EventOutcome::Failed(_)
        ));

        // A broken store still yields a response
        let outcome = worker.dispatch(WorkerEvent::Fetch(get("/sv/events"))).await;
        match outcome {
            EventOutcome::Fetch(FetchOutcome::Respond(response)) => assert_eq!(response.status, 503),
            other => panic!("unexpected outcome: {:?}", other),
        }
        worker.settle().await;
    }

    #[tokio::test]
    async fn test_push_then_click() {
        let host = Arc::new(HeadlessHost::default());
        let worker = worker(Arc::new(MemoryCacheStorage::new()), ScriptedNetwork::new(), host.clone());

        let outcome = worker
            .dispatch(WorkerEvent::Push {
                data: Some(br#"{"title":"Hej","url":"/sv/events"}"#.to_vec()),
            })
            .await;
        assert_eq!(outcome, EventOutcome::Pushed { shown: true });

        let notification = host.notifications().await.remove(0);
        match worker.dispatch(WorkerEvent::NotificationClick(notification)).await {
            EventOutcome::Navigated(window) => {
                assert_eq!(window.url.as_str(), "https://www.medieteknik.com/sv/events")
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_origin_is_rejected() {
        let config = WorkerConfig {
            origin: "not a url".to_string(),
            ..WorkerConfig::default()
        };
        let result = ServiceWorker::new(
            config,
            Arc::new(MemoryCacheStorage::new()),
            ScriptedNetwork::new(),
            Arc::new(HeadlessHost::default()),
            Arc::new(ManualClock::new(NOW)),
        );
        assert!(result.is_err());
    }
}
