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

//! Passive per-lock-name statistics. Records attempts, outcomes, wait and
//! hold times; carries no coordination logic of its own.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Statistics for one lock name
#[derive(Debug, Clone, Default, Serialize)]
pub struct LockMetrics {
    /// Acquisition attempts
    pub attempts: u64,
    /// Successful acquisitions
    pub successes: u64,
    /// Failed acquisitions (contention or timeout)
    pub failures: u64,
    /// Releases observed
    pub releases: u64,
    /// Total time spent waiting across successful acquisitions
    pub total_wait: Duration,
    /// Total time locks were held
    pub total_hold: Duration,
    /// Longest single hold
    pub max_hold: Duration,
}

impl LockMetrics {
    /// Average hold time across observed releases
    pub fn average_hold(&self) -> Duration {
        if self.releases == 0 {
            Duration::ZERO
        } else {
            self.total_hold / self.releases as u32
        }
    }

    fn merge(&mut self, other: &LockMetrics) {
        self.attempts += other.attempts;
        self.successes += other.successes;
        self.failures += other.failures;
        self.releases += other.releases;
        self.total_wait += other.total_wait;
        self.total_hold += other.total_hold;
        self.max_hold = self.max_hold.max(other.max_hold);
    }
}

/// Records attempt/success/failure/hold-time statistics per lock name.
#[derive(Debug, Default)]
pub struct LockPerformanceMonitor {
    metrics: DashMap<String, LockMetrics>,
}

impl LockPerformanceMonitor {
    /// Create a new monitor
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acquisition attempt
    pub fn record_attempt(&self, lock_name: &str) {
        self.metrics.entry(lock_name.to_string()).or_default().attempts += 1;
    }

    /// Record a successful acquisition and the time spent waiting for it
    pub fn record_success(&self, lock_name: &str, waited: Duration) {
        let mut entry = self.metrics.entry(lock_name.to_string()).or_default();
        entry.successes += 1;
        entry.total_wait += waited;
    }

    /// Record a failed acquisition
    pub fn record_failure(&self, lock_name: &str) {
        self.metrics.entry(lock_name.to_string()).or_default().failures += 1;
    }

    /// Record a release and how long the lock was held
    pub fn record_release(&self, lock_name: &str, held: Duration) {
        let mut entry = self.metrics.entry(lock_name.to_string()).or_default();
        entry.releases += 1;
        entry.total_hold += held;
        entry.max_hold = entry.max_hold.max(held);
    }

    /// Statistics for one lock name
    pub fn stats(&self, lock_name: &str) -> Option<LockMetrics> {
        self.metrics.get(lock_name).map(|m| m.clone())
    }

    /// Statistics for every lock name seen so far
    pub fn all_stats(&self) -> HashMap<String, LockMetrics> {
        self.metrics.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    /// Aggregate across all lock names
    pub fn global_stats(&self) -> LockMetrics {
        let mut total = LockMetrics::default();
        for entry in self.metrics.iter() {
            total.merge(entry.value());
        }
        total
    }

    /// Drop statistics for one lock name
    pub fn reset(&self, lock_name: &str) -> bool {
        self.metrics.remove(lock_name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_success_failure_counts() {
        let monitor = LockPerformanceMonitor::new();
        monitor.record_attempt("orders");
        monitor.record_attempt("orders");
        monitor.record_success("orders", Duration::from_millis(5));
        monitor.record_failure("orders");

        let stats = monitor.stats("orders").unwrap();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.total_wait, Duration::from_millis(5));
    }

    #[test]
    fn test_hold_time_aggregation() {
        let monitor = LockPerformanceMonitor::new();
        monitor.record_release("orders", Duration::from_millis(10));
        monitor.record_release("orders", Duration::from_millis(30));

        let stats = monitor.stats("orders").unwrap();
        assert_eq!(stats.releases, 2);
        assert_eq!(stats.total_hold, Duration::from_millis(40));
        assert_eq!(stats.max_hold, Duration::from_millis(30));
        assert_eq!(stats.average_hold(), Duration::from_millis(20));
    }

    #[test]
    fn test_global_stats_and_reset() {
        let monitor = LockPerformanceMonitor::new();
        monitor.record_attempt("a");
        monitor.record_attempt("b");
        monitor.record_success("b", Duration::ZERO);

        let global = monitor.global_stats();
        assert_eq!(global.attempts, 2);
        assert_eq!(global.successes, 1);
        assert_eq!(monitor.all_stats().len(), 2);

        assert!(monitor.reset("a"));
        assert!(!monitor.reset("a"));
        assert!(monitor.stats("a").is_none());
    }

    #[test]
    fn test_unknown_lock_has_no_stats() {
        let monitor = LockPerformanceMonitor::new();
        assert!(monitor.stats("missing").is_none());
        assert_eq!(monitor.global_stats().attempts, 0);
    }
}
