//! Age-based expiry of runtime store entries.
//!
//! Sweeping is debounced at two levels:
//!
//! 1. An in-memory marker skips any attempt within `sweep_interval` (24h) of
//!    the previous one, so the per-fetch call costs no cache I/O. The marker
//!    starts at zero whenever the worker starts.
//! 2. The runtime store's reserved `cache-timestamp` entry records the last
//!    real sweep; entries are only scanned once it is `max_age` (30 days) old.
//!    This survives worker restarts.
//!
//! A scan deletes entries whose `X-Time-Cache` stamp is older than `max_age`.
//! Entries without the stamp, and the timestamp entry itself, are kept.
//! An unreadable timestamp entry is replaced with the current time, which
//! restarts the 30-day wait without scanning.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, WorkerError};
use crate::store::{read_store_timestamp, stamp_store_timestamp, CacheStorage};

/// What a sweep attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Attempted within the in-memory interval; nothing was read.
    Debounced,
    /// The runtime store has no timestamp entry yet.
    Uninitialized,
    /// The timestamp entry was unreadable and has been reset to now.
    Restamped,
    /// The store was swept `days` ago, less than the maximum age.
    NotDue { days: i64 },
    /// Entries were scanned and `deleted` of them removed.
    Swept { deleted: usize },
}

#[derive(Debug)]
pub struct ExpirySweeper {
    runtime_cache_name: String,
    sweep_interval: Duration,
    max_age: Duration,
    last_swept_at: AtomicI64,
}

impl ExpirySweeper {
    pub fn new(runtime_cache_name: String, sweep_interval: Duration, max_age: Duration) -> Self {
        Self {
            runtime_cache_name,
            sweep_interval,
            max_age,
            last_swept_at: AtomicI64::new(0),
        }
    }

    /// Cheap check of the in-memory marker only.
    pub fn is_due(&self, now_ms: i64) -> bool {
        now_ms - self.last_swept_at.load(Ordering::SeqCst) >= self.sweep_interval.num_milliseconds()
    }

    /// Claim the in-memory slot. Only one of several concurrent callers wins.
    fn try_claim(&self, now_ms: i64) -> bool {
        let last = self.last_swept_at.load(Ordering::SeqCst);
        if now_ms - last < self.sweep_interval.num_milliseconds() {
            return false;
        }
        self.last_swept_at
            .compare_exchange(last, now_ms, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub async fn maybe_sweep(&self, storage: &dyn CacheStorage, now_ms: i64) -> Result<SweepOutcome> {
        if !self.try_claim(now_ms) {
            return Ok(SweepOutcome::Debounced);
        }

        let cache = storage.open(&self.runtime_cache_name).await?;
        let stamped_at = match read_store_timestamp(cache.as_ref()).await {
            Ok(Some(ts)) => ts,
            Ok(None) => {
                debug!(store = %self.runtime_cache_name, "No store timestamp yet, skipping sweep");
                return Ok(SweepOutcome::Uninitialized);
            }
            Err(WorkerError::CorruptTimestamp(text)) => {
                warn!(store = %self.runtime_cache_name, value = %text, "Corrupt store timestamp, resetting");
                stamp_store_timestamp(cache.as_ref(), now_ms).await?;
                return Ok(SweepOutcome::Restamped);
            }
            Err(e) => return Err(e),
        };

        let days = Duration::milliseconds(now_ms - stamped_at).num_days();
        if days < self.max_age.num_days() {
            debug!(store = %self.runtime_cache_name, days, "Store swept recently");
            return Ok(SweepOutcome::NotDue { days });
        }

        let max_age_ms = self.max_age.num_milliseconds();
        let mut deleted = 0;
        for key in cache.keys().await? {
            if key.is_store_timestamp() {
                continue;
            }
            let cached_at = match cache.match_request(&key).await? {
                Some(entry) => entry.cached_at(),
                None => continue,
            };
            if let Some(cached_at) = cached_at {
                if now_ms - cached_at > max_age_ms && cache.delete(&key).await? {
                    deleted += 1;
                }
            }
        }

        stamp_store_timestamp(cache.as_ref(), now_ms).await?;
        info!(store = %self.runtime_cache_name, deleted, "Swept expired entries");
        Ok(SweepOutcome::Swept { deleted })
    }

    /// `maybe_sweep` for callers that must not fail: errors are logged.
    pub async fn sweep_logged(&self, storage: &dyn CacheStorage, now_ms: i64) -> Option<SweepOutcome> {
        match self.maybe_sweep(storage, now_ms).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(store = %self.runtime_cache_name, error = %e, "Cache sweep failed");
                None
            }
        }
    }
}
