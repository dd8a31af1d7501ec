//! Worker configuration.
//!
//! Holds the cache version, the pattern lists that drive classification,
//! the expiry windows and the notification defaults. Every field has a
//! default, so a partial (or missing) config file is fine.
//!
//! Configuration is stored at `~/.config/portalcache/config.json`, or at the
//! path named by `PORTALCACHE_CONFIG`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "portalcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the config file location
const CONFIG_ENV: &str = "PORTALCACHE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker is registered for. Same-origin responses are `basic`.
    pub origin: String,
    /// Version suffix of both store names. Bumping it retires the old stores.
    pub cache_version: String,
    pub static_cache_prefix: String,
    pub runtime_cache_prefix: String,
    /// Languages with a precached offline page. The first path segment of a
    /// request selects one of these; anything else uses `default_language`.
    pub languages: Vec<String>,
    pub default_language: String,
    /// Extra assets precached at install, next to the offline pages.
    pub precache_assets: Vec<String>,
    /// Path fragments of known-immutable static assets.
    pub static_paths: Vec<String>,
    pub font_extensions: Vec<String>,
    /// Regex fragments; a matching path skips the worker entirely.
    pub bypass_patterns: Vec<String>,
    /// Regex fragments; a matching URL is never written to a store.
    pub blacklist_patterns: Vec<String>,
    /// Framework query parameter stripped from cache keys.
    pub cache_busting_param: String,
    pub max_entry_age_days: i64,
    pub sweep_interval_hours: i64,
    /// Upper bound on one network attempt before falling back to the cache.
    pub network_timeout_ms: u64,
    pub periodic_sync_tag: String,
    pub periodic_sync_min_interval_hours: u64,
    pub notification: NotificationDefaults,
}

/// Values used for any push payload field that is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub vibrate: Vec<u32>,
    pub require_interaction: bool,
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "Medieteknik".to_string(),
            body: "You have a new notification".to_string(),
            icon: "/images/logo.webp".to_string(),
            badge: "/images/logo.webp".to_string(),
            tag: "medieteknik-notification".to_string(),
            vibrate: vec![100, 50, 100],
            require_interaction: false,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: "https://www.medieteknik.com".to_string(),
            cache_version: "v1".to_string(),
            static_cache_prefix: "static".to_string(),
            runtime_cache_prefix: "runtime".to_string(),
            languages: strings(&["sv", "en"]),
            default_language: "en".to_string(),
            precache_assets: strings(&["/images/logo.webp"]),
            static_paths: strings(&["/_next/static/", "/manifest.webmanifest", "/images/logo.webp"]),
            font_extensions: strings(&["woff2", "woff", "ttf"]),
            bypass_patterns: strings(&[
                r"/__nextjs",
                r"/_next/webpack-hmr",
                r"^/sw\.js$",
                r"^/api/send$",
            ]),
            blacklist_patterns: strings(&[
                r"/screenshots/",
                r"__nextjs_original-stack-frame",
                r"%2Fmedieteknik-static%2Fprofile%2F",
                r"%2Fmedieteknik-static%2Fnews%2F",
                r"/_next/image\?url=https%3A%2F%2Fi\.ytimg\.com",
                r"/umami/script\.js",
            ]),
            cache_busting_param: "_rsc".to_string(),
            max_entry_age_days: 30,
            sweep_interval_hours: 24,
            network_timeout_ms: 10_000,
            periodic_sync_tag: "cache-cleanup".to_string(),
            periodic_sync_min_interval_hours: 24,
            notification: NotificationDefaults::default(),
        }
    }
}

impl WorkerConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin).with_context(|| format!("Invalid origin: {}", self.origin))
    }

    pub fn static_cache_name(&self) -> String {
        format!("{}-{}", self.static_cache_prefix, self.cache_version)
    }

    pub fn runtime_cache_name(&self) -> String {
        format!("{}-{}", self.runtime_cache_prefix, self.cache_version)
    }

    /// Store names that survive activation.
    pub fn current_cache_names(&self) -> [String; 2] {
        [self.static_cache_name(), self.runtime_cache_name()]
    }

    /// Path of the offline page for a language.
    pub fn offline_path(lang: &str) -> String {
        format!("/{}/~offline", lang)
    }

    /// Paths inserted into the static store at install.
    pub fn precache_manifest(&self) -> Vec<String> {
        self.languages
            .iter()
            .map(|lang| Self::offline_path(lang))
            .chain(self.precache_assets.iter().cloned())
            .collect()
    }

    pub fn max_entry_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_entry_age_days)
    }

    pub fn sweep_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.sweep_interval_hours)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn periodic_sync_min_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_sync_min_interval_hours * 60 * 60)
    }
}
