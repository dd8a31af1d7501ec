//! Cache eligibility decisions.
//!
//! Pure functions over a request (and, for the write gate, its response).
//! Classification decides whether and where a response may be *stored*; it
//! never decides whether a response is *served*.

use regex::Regex;
use url::Url;

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::http::{CacheKey, Request, Response, ResponseType};

/// `max-age` value the framework sets on fingerprinted assets (one year).
const ONE_YEAR_SECS: &str = "31536000";

/// How the interceptor should treat a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Don't intercept at all; the host's default network handling applies.
    BypassToNetwork,
    /// Serve from the static store, refresh in the background.
    StaleWhileRevalidate,
    /// Try the network, fall back to the runtime store and the offline page.
    NetworkFirst,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    bypass: Option<Regex>,
    blacklist: Option<Regex>,
    static_paths: Vec<String>,
    font_extensions: Vec<String>,
    cache_busting_param: String,
}

/// Join fragments into one alternation. An empty list never matches.
fn alternation(patterns: &[String]) -> Result<Option<Regex>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let joined = patterns
        .iter()
        .map(|p| format!("(?:{})", p))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&joined)
        .map(Some)
        .map_err(|e| WorkerError::InvalidRequest(format!("invalid pattern list: {}", e)))
}

impl Classifier {
    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        Ok(Self {
            bypass: alternation(&config.bypass_patterns)?,
            blacklist: alternation(&config.blacklist_patterns)?,
            static_paths: config.static_paths.clone(),
            font_extensions: config
                .font_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            cache_busting_param: config.cache_busting_param.clone(),
        })
    }

    pub fn classify(&self, request: &Request) -> Classification {
        if self.should_bypass_network_cache(request) {
            Classification::BypassToNetwork
        } else if self.is_static_asset_request(request) {
            Classification::StaleWhileRevalidate
        } else {
            Classification::NetworkFirst
        }
    }

    /// True when the worker must not touch the cache layer for this request.
    pub fn should_bypass_network_cache(&self, request: &Request) -> bool {
        if let Some(ref bypass) = self.bypass {
            if bypass.is_match(request.url.path()) {
                return true;
            }
        }

        match request.headers.get("cache-control") {
            Some(value) => cache_control_forbids_worker(value),
            None => false,
        }
    }

    /// Fonts and known-immutable static paths.
    pub fn is_static_asset_request(&self, request: &Request) -> bool {
        let path = request.url.path();

        let is_font = path
            .rsplit_once('.')
            .map(|(_, ext)| {
                let ext = ext.to_ascii_lowercase();
                self.font_extensions.iter().any(|f| *f == ext)
            })
            .unwrap_or(false);

        is_font || self.static_paths.iter().any(|p| path.contains(p.as_str()))
    }

    /// Gate for writing `response` into a store.
    pub fn is_cacheable_response(&self, response: &Response, request: &Request) -> bool {
        if response.status != 200 || response.response_type != ResponseType::Basic {
            return false;
        }
        if !request.is_get() || !matches!(request.url.scheme(), "http" | "https") {
            return false;
        }
        if request.url.path().contains("/api/") {
            return false;
        }
        match self.blacklist {
            Some(ref blacklist) => !blacklist.is_match(request.url.as_str()),
            None => true,
        }
    }

    /// Key under which `request` is stored and looked up.
    pub fn cache_key(&self, request: &Request) -> CacheKey {
        CacheKey::from_url(&strip_query_param(&request.url, &self.cache_busting_param))
    }
}

fn cache_control_forbids_worker(value: &str) -> bool {
    value.split(',').any(|directive| {
        let directive = directive.trim().to_ascii_lowercase();
        match directive.split_once('=') {
            Some((name, arg)) => name.trim() == "max-age" && arg.trim().trim_matches('"') == ONE_YEAR_SECS,
            None => directive == "no-store" || directive == "immutable",
        }
    })
}

/// Remove every occurrence of `param` from the query, keeping the rest of the
/// query exactly as written.
fn strip_query_param(url: &Url, param: &str) -> Url {
    let query = match url.query() {
        Some(q) if !param.is_empty() => q,
        _ => return url.clone(),
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split_once('=').map(|(n, _)| n).unwrap_or(pair);
            !pair.is_empty() && name != param
        })
        .collect();

    let mut stripped = url.clone();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.set_query(Some(&kept.join("&")));
    }
    stripped
}
