// Copyright 2025 Lockstep Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Stale-write guard.
//!
//! Records when each cache entry was last invalidated so writers can reject
//! data fetched before that instant. Entries are pruned opportunistically
//! every [`PRUNE_EVERY`] records and by an optional periodic task, bounding
//! memory without a write on every call.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Opportunistic prune cadence, in recorded invalidations.
const PRUNE_EVERY: u64 = 256;

/// Default retention for invalidation records.
const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Timestamp-keyed invalidation map.
#[derive(Debug)]
pub struct CacheInvalidationTracker {
    /// `{cache_type}:{cache_key}` -> invalidation time, unix milliseconds
    entries: DashMap<String, u64>,
    records: AtomicU64,
    retention: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Default for CacheInvalidationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheInvalidationTracker {
    /// Create a tracker with the default one-hour retention.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create a tracker with a custom retention window.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            records: AtomicU64::new(0),
            retention,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn composite(cache_type: &str, cache_key: &str) -> String {
        format!("{cache_type}:{cache_key}")
    }

    /// Record that `{cache_type}:{cache_key}` was invalidated now.
    /// Returns the timestamp recorded.
    pub fn record_invalidation(&self, cache_type: &str, cache_key: &str) -> u64 {
        self.record_invalidation_at(cache_type, cache_key, unix_millis())
    }

    /// Record an invalidation with an explicit timestamp (the producer's
    /// clock, when replaying a broadcast event).
    pub fn record_invalidation_at(&self, cache_type: &str, cache_key: &str, timestamp: u64) -> u64 {
        self.entries.insert(Self::composite(cache_type, cache_key), timestamp);
        if self.records.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune();
        }
        timestamp
    }

    /// Whether data stamped `data_timestamp` (unix milliseconds) predates the
    /// most recent invalidation of this entry and must be discarded.
    pub fn is_invalidated(&self, cache_type: &str, cache_key: &str, data_timestamp: u64) -> bool {
        self.entries
            .get(&Self::composite(cache_type, cache_key))
            .is_some_and(|invalidated_at| data_timestamp < *invalidated_at)
    }

    /// Remove the record once fresh data is confirmed written, so the same
    /// entry can be invalidated again later.
    pub fn clear_invalidation(&self, cache_type: &str, cache_key: &str) -> bool {
        self.entries.remove(&Self::composite(cache_type, cache_key)).is_some()
    }

    /// Drop records older than the retention window. Returns how many were
    /// removed.
    pub fn prune(&self) -> usize {
        let cutoff = unix_millis().saturating_sub(self.retention.as_millis() as u64);
        let before = self.entries.len();
        self.entries.retain(|_, timestamp| *timestamp >= cutoff);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "pruned stale invalidation records");
        }
        removed
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tracker holds no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn a periodic prune task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_pruner(self: &Arc<Self>, interval: Duration) {
        let tracker = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    debug!("invalidation pruner shutting down");
                    break;
                }
                tracker.prune();
            }
        });
    }

    /// Stop the periodic prune task.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidation_ordering() {
        let tracker = CacheInvalidationTracker::new();
        let stamped = tracker.record_invalidation("userSession", "tok-abc");

        // Data fetched before the invalidation is stale.
        assert!(tracker.is_invalidated("userSession", "tok-abc", stamped - 1));
        // Data fetched after it is fine.
        assert!(!tracker.is_invalidated("userSession", "tok-abc", stamped + 1));
        // A timestamp equal to the invalidation instant is not "before" it.
        assert!(!tracker.is_invalidated("userSession", "tok-abc", stamped));
    }

    #[test]
    fn test_unknown_entry_is_not_invalidated() {
        let tracker = CacheInvalidationTracker::new();
        assert!(!tracker.is_invalidated("userSession", "missing", 0));
    }

    #[test]
    fn test_clear_allows_reinvalidation() {
        let tracker = CacheInvalidationTracker::new();
        let first = tracker.record_invalidation_at("t", "k", 1_000);
        assert!(tracker.is_invalidated("t", "k", first - 1));

        assert!(tracker.clear_invalidation("t", "k"));
        assert!(!tracker.clear_invalidation("t", "k"));
        assert!(!tracker.is_invalidated("t", "k", first - 1));

        tracker.record_invalidation_at("t", "k", 2_000);
        assert!(tracker.is_invalidated("t", "k", 1_500));
    }

    #[test]
    fn test_prune_drops_old_records() {
        let tracker = CacheInvalidationTracker::with_retention(Duration::from_secs(60));
        let now = unix_millis();
        tracker.record_invalidation_at("t", "old", now - 120_000);
        tracker.record_invalidation_at("t", "fresh", now);

        assert_eq!(tracker.prune(), 1);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_invalidated("t", "fresh", now - 1));
        assert!(!tracker.is_invalidated("t", "old", 0));
    }

    #[test]
    fn test_opportunistic_prune_cadence() {
        let tracker = CacheInvalidationTracker::with_retention(Duration::from_secs(60));
        let stale = unix_millis() - 120_000;
        tracker.record_invalidation_at("t", "old", stale);

        // Recording up to the cadence boundary triggers a prune in passing.
        for i in 0..PRUNE_EVERY {
            tracker.record_invalidation_at("t", &format!("k{i}"), unix_millis());
        }
        assert!(!tracker.is_invalidated("t", "old", 0));
    }
}
