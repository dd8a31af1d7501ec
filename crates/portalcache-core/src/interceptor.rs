//! Fetch interception.
//!
//! Static assets are served stale-while-revalidate from the static store.
//! Everything else goes network-first: a successful response is stamped and
//! written to the runtime store in the background, and a failed attempt falls
//! back to the runtime store, then any store, then the offline page for the
//! request's language, then a synthesized `503`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tracing::{debug, warn};
use url::Url;

use crate::classifier::Classification;
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::http::{CacheKey, Request, Response};
use crate::network::Network;
use crate::worker::WorkerContext;

/// What the host should do with an intercepted request.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Not handled; the host performs its default network fetch.
    Passthrough,
    Respond(Response),
}

type SharedFetch = Shared<BoxFuture<'static, Result<Response>>>;

/// What makes two `GET`s the same network attempt: the full URL and every
/// request header. Cache-key normalization plays no part here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    url: String,
    headers: Vec<(String, String)>,
}

impl FlightKey {
    fn of(request: &Request) -> Self {
        Self {
            url: request.url.as_str().to_string(),
            headers: request
                .headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }
}

/// Network attempts currently running.
#[derive(Default)]
struct InFlight {
    next_id: AtomicU64,
    pending: Mutex<HashMap<FlightKey, (u64, SharedFetch)>>,
}

impl InFlight {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FlightKey, (u64, SharedFetch)>> {
        match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Forget attempt `id`, unless a newer attempt already took its place.
    fn finish(&self, key: &FlightKey, id: u64) {
        let mut pending = self.lock();
        if matches!(pending.get(key), Some((current, _)) if *current == id) {
            pending.remove(key);
        }
    }
}

async fn fetch_with_timeout(network: &dyn Network, request: &Request, timeout: Duration) -> Result<Response> {
    match tokio::time::timeout(timeout, network.fetch(request)).await {
        Ok(result) => result,
        Err(_) => Err(WorkerError::Timeout(timeout)),
    }
}

/// Clone is cheap - both fields are `Arc`s, so spawned revalidations share
/// the same in-flight table.
#[derive(Clone)]
pub struct FetchInterceptor {
    ctx: Arc<WorkerContext>,
    in_flight: Arc<InFlight>,
}

impl FetchInterceptor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self {
            ctx,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        let classification = self.ctx.classifier.classify(&request);
        if classification == Classification::BypassToNetwork {
            debug!(url = %request.url, "Bypassing worker");
            return FetchOutcome::Passthrough;
        }

        self.schedule_sweep();

        let response = match classification {
            Classification::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
            _ => self.network_first(request).await,
        };
        FetchOutcome::Respond(response)
    }

    /// Wait for every background write, revalidation and sweep.
    pub async fn settle(&self) {
        self.ctx.tasks.settle().await;
    }

    fn schedule_sweep(&self) {
        if !self.ctx.sweeper.is_due(self.ctx.clock.now_ms()) {
            return;
        }
        let ctx = self.ctx.clone();
        self.ctx.tasks.spawn(async move {
            ctx.sweeper
                .sweep_logged(ctx.storage.as_ref(), ctx.clock.now_ms())
                .await;
        });
    }

    // ========================================================================
    // Strategies
    // ========================================================================

    async fn stale_while_revalidate(&self, request: Request) -> Response {
        let store = self.ctx.config.static_cache_name();
        let key = CacheKey::from_url(&request.url);

        let cached = match self.lookup(&store, &key).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(store = %store, key = %key, error = %e, "Static store lookup failed");
                None
            }
        };

        if let Some(cached) = cached {
            debug!(key = %key, "Serving static asset from cache");
            let this = self.clone();
            self.ctx.tasks.spawn(async move {
                match this.fetch_network(&request).await {
                    Ok(response) => this.write_back(&store, &request, key, response).await,
                    Err(e) => debug!(key = %key, error = %e, "Revalidation failed"),
                }
            });
            return cached;
        }

        match self.fetch_network(&request).await {
            Ok(response) => {
                let this = self.clone();
                let stored = response.clone();
                self.ctx.tasks.spawn(async move {
                    this.write_back(&store, &request, key, stored).await;
                });
                response
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Static asset unavailable");
                Response::service_unavailable()
            }
        }
    }

    async fn network_first(&self, request: Request) -> Response {
        let key = self.ctx.classifier.cache_key(&request);

        match self.fetch_network(&request).await {
            Ok(response) => {
                if self.ctx.classifier.is_cacheable_response(&response, &request) {
                    let stamped = response.stamped(self.ctx.clock.now_ms());
                    let store = self.ctx.config.runtime_cache_name();
                    let ctx = self.ctx.clone();
                    self.ctx.tasks.spawn(async move {
                        if let Err(e) = put(&ctx, &store, &key, stamped).await {
                            warn!(store = %store, key = %key, error = %e, "Failed to cache response");
                        }
                    });
                }
                response
            }
            Err(e) => {
                if e.is_network_failure() {
                    debug!(url = %request.url, error = %e, "Network unavailable, falling back to cache");
                } else {
                    warn!(url = %request.url, error = %e, "Network attempt failed, falling back to cache");
                }
                self.offline_response(&request, &key).await
            }
        }
    }

    // ========================================================================
    // Network
    // ========================================================================

    /// One network attempt. Concurrent identical `GET`s share a single
    /// attempt.
    async fn fetch_network(&self, request: &Request) -> Result<Response> {
        let timeout = self.ctx.config.network_timeout();
        if !request.is_get() {
            return fetch_with_timeout(self.ctx.network.as_ref(), request, timeout).await;
        }

        let key = FlightKey::of(request);
        let attempt = {
            let mut pending = self.in_flight.lock();
            if let Some((_, attempt)) = pending.get(&key) {
                debug!(url = %request.url, "Joining in-flight request");
                attempt.clone()
            } else {
                let id = self.in_flight.next_id.fetch_add(1, Ordering::Relaxed);
                let network = self.ctx.network.clone();
                let in_flight = self.in_flight.clone();
                let request = request.clone();
                let task_key = key.clone();
                // Runs on its own task so it finishes and leaves the table even
                // when every caller has gone away.
                let handle = tokio::spawn(async move {
                    let result = fetch_with_timeout(network.as_ref(), &request, timeout).await;
                    in_flight.finish(&task_key, id);
                    result
                });
                let attempt = async move {
                    handle
                        .await
                        .unwrap_or_else(|e| Err(WorkerError::Network(format!("fetch task failed: {}", e))))
                }
                .boxed()
                .shared();
                pending.insert(key, (id, attempt.clone()));
                attempt
            }
        };

        attempt.await
    }

    // ========================================================================
    // Stores
    // ========================================================================

    async fn lookup(&self, store: &str, key: &CacheKey) -> Result<Option<Response>> {
        let cache = self.ctx.storage.open(store).await?;
        cache.match_request(key).await
    }

    async fn write_back(&self, store: &str, request: &Request, key: CacheKey, response: Response) {
        if !self.ctx.classifier.is_cacheable_response(&response, request) {
            debug!(key = %key, status = response.status, "Not caching response");
            return;
        }
        if let Err(e) = put(&self.ctx, store, &key, response).await {
            warn!(store = %store, key = %key, error = %e, "Failed to cache response");
        }
    }

    /// Fallback chain for a failed network attempt. Never fails.
    async fn offline_response(&self, request: &Request, key: &CacheKey) -> Response {
        if request.is_get() {
            match self.cached_fallback(key).await {
                Ok(Some(cached)) => {
                    debug!(key = %key, "Serving cached response");
                    return cached;
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Cache fallback failed"),
            }
        }

        match self.offline_page(&request.url).await {
            Ok(Some(page)) => page,
            Ok(None) => {
                warn!(url = %request.url, "Offline page not cached");
                Response::service_unavailable()
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Offline page lookup failed");
                Response::service_unavailable()
            }
        }
    }

    async fn cached_fallback(&self, key: &CacheKey) -> Result<Option<Response>> {
        let runtime = self.ctx.config.runtime_cache_name();
        if let Some(cached) = self.lookup(&runtime, key).await? {
            return Ok(Some(cached));
        }
        self.ctx.storage.match_any(key).await
    }

    async fn offline_page(&self, url: &Url) -> Result<Option<Response>> {
        let lang = offline_language(&self.ctx.config, url);
        let page = self.ctx.origin.join(&WorkerConfig::offline_path(lang))?;
        debug!(lang, page = %page, "Looking up offline page");
        self.lookup(&self.ctx.config.static_cache_name(), &CacheKey::from_url(&page))
            .await
    }
}

async fn put(ctx: &WorkerContext, store: &str, key: &CacheKey, response: Response) -> Result<()> {
    let cache = ctx.storage.open(store).await?;
    cache.put(key, response).await
}

/// Language whose offline page a request should get: its first path segment
/// if that is a configured language, otherwise the default.
fn offline_language<'a>(config: &'a WorkerConfig, url: &Url) -> &'a str {
    let first = url
        .path_segments()
        .and_then(|mut segments| segments.next())
        .unwrap_or("");
    config
        .languages
        .iter()
        .find(|lang| lang.as_str() == first)
        .map(String::as_str)
        .unwrap_or(config.default_language.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::host::HeadlessHost;
    use crate::http::{Method, ResponseType, TIME_CACHE_HEADER};
    use crate::store::{CacheStorage, MemoryCacheStorage};
    use crate::test_support::{get, key, url, ScriptedNetwork, DAY_MS};

    const NOW: i64 = 1_750_000_000_000;

    struct Fixture {
        interceptor: FetchInterceptor,
        storage: Arc<MemoryCacheStorage>,
        network: Arc<ScriptedNetwork>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(config: WorkerConfig) -> Fixture {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = ScriptedNetwork::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let ctx = WorkerContext::new(
            config,
            storage.clone(),
            network.clone(),
            Arc::new(HeadlessHost::default()),
            clock.clone(),
        )
        .unwrap();
        Fixture {
            interceptor: FetchInterceptor::new(Arc::new(ctx)),
            storage,
            network,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(WorkerConfig::default())
    }

    impl Fixture {
        async fn fetch(&self, request: Request) -> Response {
            match self.interceptor.handle_fetch(request).await {
                FetchOutcome::Respond(response) => response,
                FetchOutcome::Passthrough => panic!("request was not intercepted"),
            }
        }

        async fn store(&self, name: &str, path: &str, response: Response) {
            let cache = self.storage.open(name).await.unwrap();
            cache.put(&key(path), response).await.unwrap();
        }

        async fn stored(&self, name: &str, path: &str) -> Option<Response> {
            let cache = self.storage.open(name).await.unwrap();
            cache.match_request(&key(path)).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_bypassed_request_passes_through() {
        let f = fixture();
        let outcome = f.interceptor.handle_fetch(get("/_next/webpack-hmr")).await;
        assert_eq!(outcome, FetchOutcome::Passthrough);

        let immutable = get("/_next/static/chunks/app.js").with_header("Cache-Control", "public, immutable");
        assert_eq!(f.interceptor.handle_fetch(immutable).await, FetchOutcome::Passthrough);
        assert_eq!(f.network.calls(), 0);
    }

    #[tokio::test]
    async fn test_network_first_stamps_and_stores() {
        let f = fixture();
        f.network.respond(&url("/sv/events"), Response::ok("events"));

        let response = f.fetch(get("/sv/events")).await;
        assert_eq!(response.body_text(), "events");
        // The caller gets the response as fetched
        assert!(response.headers.get(TIME_CACHE_HEADER).is_none());

        f.interceptor.settle().await;
        let stored = f.stored("runtime-v1", "/sv/events").await.unwrap();
        assert_eq!(stored.cached_at(), Some(NOW));
        assert_eq!(stored.body_text(), "events");
    }

    #[tokio::test]
    async fn test_network_first_ignores_cache_busting_param() {
        let f = fixture();
        f.network.respond(&url("/sv/events?_rsc=abc"), Response::ok("rsc payload"));

        f.fetch(get("/sv/events?_rsc=abc")).await;
        f.interceptor.settle().await;

        assert!(f.stored("runtime-v1", "/sv/events").await.is_some());
        assert!(f.stored("runtime-v1", "/sv/events?_rsc=abc").await.is_none());
    }

    #[tokio::test]
    async fn test_uncacheable_responses_are_not_stored() {
        let f = fixture();
        f.network.respond(&url("/sv/missing"), Response::text(404, "not found"));
        f.network.respond(&url("/api/user"), Response::ok("{}"));
        f.network.respond(&url("/screenshots/a.png"), Response::ok("png"));

        assert_eq!(f.fetch(get("/sv/missing")).await.status, 404);
        f.fetch(get("/api/user")).await;
        f.fetch(get("/screenshots/a.png")).await;
        f.interceptor.settle().await;

        let runtime = f.storage.open("runtime-v1").await.unwrap();
        assert!(runtime.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cross_origin_response_is_not_stored() {
        let f = fixture();
        let cdn = "https://cdn.example.com/lib.js";
        f.network
            .respond(cdn, Response::ok("lib").with_type(ResponseType::Cors));

        f.fetch(Request::get(cdn).unwrap()).await;
        f.interceptor.settle().await;

        let runtime = f.storage.open("runtime-v1").await.unwrap();
        assert!(runtime.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_falls_back_to_runtime_entry() {
        let f = fixture();
        f.store("runtime-v1", "/sv/events", Response::ok("cached events").stamped(NOW - DAY_MS))
            .await;

        let response = f.fetch(get("/sv/events?_rsc=1")).await;
        assert_eq!(response.body_text(), "cached events");
    }

    #[tokio::test]
    async fn test_offline_falls_back_to_any_store() {
        let f = fixture();
        f.store("static-v1", "/sv/about", Response::ok("about")).await;

        let response = f.fetch(get("/sv/about")).await;
        assert_eq!(response.body_text(), "about");
    }

    #[tokio::test]
    async fn test_offline_page_follows_language() {
        let f = fixture();
        f.store("static-v1", "/sv/~offline", Response::ok("Du är offline")).await;
        f.store("static-v1", "/en/~offline", Response::ok("You are offline")).await;

        assert_eq!(f.fetch(get("/sv/events/12")).await.body_text(), "Du är offline");
        assert_eq!(f.fetch(get("/sv")).await.body_text(), "Du är offline");
        assert_eq!(f.fetch(get("/en/events")).await.body_text(), "You are offline");
        assert_eq!(f.fetch(get("/svenska")).await.body_text(), "You are offline");
        assert_eq!(f.fetch(get("/")).await.body_text(), "You are offline");
    }

    #[tokio::test]
    async fn test_offline_without_offline_page_is_503() {
        let f = fixture();
        let response = f.fetch(get("/sv/events")).await;
        assert_eq!(response.status, 503);
        assert_eq!(response.body_text(), "Service Unavailable");
    }

    #[tokio::test]
    async fn test_failed_post_skips_cache_lookup() {
        let f = fixture();
        f.store("runtime-v1", "/sv/form", Response::ok("cached form")).await;
        f.store("static-v1", "/sv/~offline", Response::ok("offline")).await;

        let request = Request::new(Method::Post, Url::parse(&url("/sv/form")).unwrap());
        let response = f.fetch(request).await;
        assert_eq!(response.body_text(), "offline");
    }

    #[tokio::test]
    async fn test_post_is_never_stored() {
        let f = fixture();
        f.network.respond(&url("/sv/form"), Response::ok("posted"));

        let request = Request::new(Method::Post, Url::parse(&url("/sv/form")).unwrap());
        assert_eq!(f.fetch(request).await.body_text(), "posted");
        f.interceptor.settle().await;
        assert!(f.stored("runtime-v1", "/sv/form").await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_triggers_fallback() {
        let f = fixture_with(WorkerConfig {
            network_timeout_ms: 20,
            ..WorkerConfig::default()
        });
        f.network.respond(&url("/sv/events"), Response::ok("too late"));
        f.network.set_delay(Duration::from_millis(500));
        f.store("runtime-v1", "/sv/events", Response::ok("cached")).await;

        let response = f.fetch(get("/sv/events")).await;
        assert_eq!(response.body_text(), "cached");
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_serves_cache_then_refreshes() {
        let f = fixture();
        let path = "/_next/static/chunks/app.js";
        f.store("static-v1", path, Response::ok("A")).await;
        f.network.respond(&url(path), Response::ok("B"));

        let response = f.fetch(get(path)).await;
        assert_eq!(response.body_text(), "A");

        f.interceptor.settle().await;
        assert_eq!(f.network.calls_for(&url(path)), 1);
        assert_eq!(f.stored("static-v1", path).await.unwrap().body_text(), "B");
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_miss_waits_for_network() {
        let f = fixture();
        let path = "/fonts/inter.woff2";
        f.network.respond(&url(path), Response::ok("font"));

        assert_eq!(f.fetch(get(path)).await.body_text(), "font");
        f.interceptor.settle().await;

        let stored = f.stored("static-v1", path).await.unwrap();
        assert_eq!(stored.body_text(), "font");
        // Static entries are exempt from age-based expiry
        assert_eq!(stored.cached_at(), None);
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_keeps_entry_on_failure() {
        let f = fixture();
        let path = "/manifest.webmanifest";
        f.store("static-v1", path, Response::ok("manifest")).await;
        f.network.fail(&url(path));

        assert_eq!(f.fetch(get(path)).await.body_text(), "manifest");
        f.interceptor.settle().await;
        assert_eq!(f.stored("static-v1", path).await.unwrap().body_text(), "manifest");
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_miss_offline_is_503() {
        let f = fixture();
        assert_eq!(f.fetch(get("/_next/static/css/site.css")).await.status, 503);
    }

    #[tokio::test]
    async fn test_concurrent_identical_gets_share_one_network_call() {
        let f = fixture();
        f.network.respond(&url("/sv/events"), Response::ok("events"));
        f.network.set_delay(Duration::from_millis(50));

        let (a, b) = tokio::join!(
            f.interceptor.handle_fetch(get("/sv/events")),
            f.interceptor.handle_fetch(get("/sv/events")),
        );
        assert!(matches!(a, FetchOutcome::Respond(ref r) if r.body_text() == "events"));
        assert!(matches!(b, FetchOutcome::Respond(ref r) if r.body_text() == "events"));
        assert_eq!(f.network.calls(), 1);

        // Finished attempts are forgotten
        f.fetch(get("/sv/events")).await;
        assert_eq!(f.network.calls(), 2);
    }

    #[tokio::test]
    async fn test_rsc_variant_gets_its_own_network_call() {
        let f = fixture();
        f.network.respond(&url("/sv/events"), Response::ok("<html>page</html>"));
        f.network.respond(&url("/sv/events?_rsc=x"), Response::ok("rsc payload"));
        f.network.set_delay(Duration::from_millis(50));

        let (page, rsc) = tokio::join!(
            f.fetch(get("/sv/events")),
            f.fetch(get("/sv/events?_rsc=x").with_header("RSC", "1")),
        );
        assert_eq!(page.body_text(), "<html>page</html>");
        assert_eq!(rsc.body_text(), "rsc payload");
        assert_eq!(f.network.calls_for(&url("/sv/events")), 1);
        assert_eq!(f.network.calls_for(&url("/sv/events?_rsc=x")), 1);
    }

    #[tokio::test]
    async fn test_same_url_with_different_headers_is_not_shared() {
        let f = fixture();
        f.network.respond(&url("/sv/events"), Response::ok("events"));
        f.network.set_delay(Duration::from_millis(50));

        tokio::join!(
            f.fetch(get("/sv/events")),
            f.fetch(get("/sv/events").with_header("RSC", "1")),
        );
        assert_eq!(f.network.calls_for(&url("/sv/events")), 2);
    }

    #[tokio::test]
    async fn test_abandoned_attempt_leaves_in_flight_table() {
        let f = fixture();
        f.network.respond(&url("/sv/events"), Response::ok("events"));
        f.network.set_delay(Duration::from_millis(50));

        let interceptor = f.interceptor.clone();
        let caller = tokio::spawn(async move { interceptor.handle_fetch(get("/sv/events")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();

        // The attempt still completes on its own and is then forgotten
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.network.set_delay(Duration::ZERO);
        assert_eq!(f.fetch(get("/sv/events")).await.body_text(), "events");
        assert_eq!(f.network.calls(), 2);
    }

    #[tokio::test]
    async fn test_fetch_triggers_opportunistic_sweep() {
        let f = fixture();
        let runtime = f.storage.open("runtime-v1").await.unwrap();
        crate::store::stamp_store_timestamp(runtime.as_ref(), NOW - 31 * DAY_MS)
            .await
            .unwrap();
        f.store("runtime-v1", "/old", Response::ok("old").stamped(NOW - 40 * DAY_MS))
            .await;
        f.network.respond(&url("/sv"), Response::ok("home"));

        f.fetch(get("/sv")).await;
        f.interceptor.settle().await;
        assert!(f.stored("runtime-v1", "/old").await.is_none());

        // Within the interval no sweep runs even if the store is stale again
        f.store("runtime-v1", "/old", Response::ok("old").stamped(NOW - 40 * DAY_MS))
            .await;
        f.clock.advance(chrono::Duration::hours(1));
        f.fetch(get("/sv")).await;
        f.interceptor.settle().await;
        assert!(f.stored("runtime-v1", "/old").await.is_some());
    }
}
