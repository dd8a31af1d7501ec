//! Offline caching service worker core.
//!
//! Intercepts page requests and serves them from two versioned stores:
//! a static store for precached pages and immutable assets, and a runtime
//! store for everything fetched network-first. Runtime entries expire after
//! 30 days. The host platform (pages, notifications, background sync) and
//! the network are traits, so the worker runs the same against a real
//! network and disk store as it does in tests.

pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod host;
pub mod http;
pub mod interceptor;
pub mod lifecycle;
pub mod network;
pub mod notification;
pub mod store;
pub mod sweeper;
pub mod tasks;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use http::{CacheKey, Method, Request, Response};
pub use interceptor::FetchOutcome;
pub use worker::{EventOutcome, ServiceWorker, WorkerEvent};
