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

//! Local wait-for graph and cycle detection.
//!
//! The lock services feed acquisition and wait events into the graph; a
//! periodic scan force-releases expired holders, runs depth-first cycle
//! detection, and breaks each cycle by releasing the member holding the
//! fewest locks. Store-side release happens through the [`ForceReleaser`]
//! wired in by the lock service.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::DetectorConfig;
use crate::types::DeadlockStatus;

/// Store-side release path for locks the detector decides to break.
///
/// Implemented by the lock service: deletes the store key regardless of the
/// holder token and clears node-local bookkeeping. Releasing a key that is
/// already gone is a no-op, so duplicate force releases are safe.
#[async_trait]
pub trait ForceReleaser: Send + Sync + std::fmt::Debug {
    /// Release the lock at `lock_key` regardless of its current holder.
    /// Returns whether a store-side entry was actually removed.
    async fn force_release(&self, lock_key: &str) -> bool;
}

#[derive(Debug, Default)]
struct GraphState {
    /// owner -> locks held
    owner_locks: HashMap<String, HashSet<String>>,
    /// owner -> locks waited on
    owner_waits: HashMap<String, HashSet<String>>,
    /// lock -> holding owner
    lock_holders: HashMap<String, String>,
    /// lock -> waiting owners
    lock_waiters: HashMap<String, HashSet<String>>,
    /// owner -> safety deadline
    owner_deadlines: HashMap<String, Instant>,
}

/// In-process deadlock detector.
#[derive(Debug)]
pub struct DeadlockDetector {
    config: DetectorConfig,
    state: Mutex<GraphState>,
    releaser: RwLock<Option<Arc<dyn ForceReleaser>>>,
    scans: AtomicU64,
    cycles_found: AtomicU64,
    forced_releases: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl DeadlockDetector {
    /// Create a new detector. Call [`start`](Self::start) to begin periodic
    /// scanning.
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GraphState::default()),
            releaser: RwLock::new(None),
            scans: AtomicU64::new(0),
            cycles_found: AtomicU64::new(0),
            forced_releases: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wire the store-side release path.
    pub fn set_force_releaser(&self, releaser: Arc<dyn ForceReleaser>) {
        *self.releaser.write() = Some(releaser);
    }

    /// Detector configuration
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Spawn the periodic scan task.
    pub fn start(self: &Arc<Self>) {
        let detector = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let interval = self.config.scan_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    debug!("deadlock detector shutting down");
                    break;
                }
                detector.scan().await;
            }
        });
    }

    /// Stop the periodic scan task.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Graph recording, called from the lock services
    // ------------------------------------------------------------------

    /// Record that `owner` now holds `lock_key`.
    pub fn record_lock_acquired(&self, owner: &str, lock_key: &str) {
        let mut state = self.state.lock();
        state
            .owner_locks
            .entry(owner.to_string())
            .or_default()
            .insert(lock_key.to_string());
        state.lock_holders.insert(lock_key.to_string(), owner.to_string());
        state
            .owner_deadlines
            .insert(owner.to_string(), Instant::now() + self.config.owner_deadline);
    }

    /// Record that `owner` released `lock_key`.
    pub fn record_lock_released(&self, owner: &str, lock_key: &str) {
        let mut state = self.state.lock();
        if let Some(locks) = state.owner_locks.get_mut(owner) {
            locks.remove(lock_key);
            if locks.is_empty() {
                state.owner_locks.remove(owner);
                state.owner_deadlines.remove(owner);
            }
        }
        if state.lock_holders.get(lock_key).map(String::as_str) == Some(owner) {
            state.lock_holders.remove(lock_key);
        }
    }

    /// Record that `owner` started waiting for `lock_key`.
    pub fn record_wait_start(&self, owner: &str, lock_key: &str) {
        let mut state = self.state.lock();
        state
            .owner_waits
            .entry(owner.to_string())
            .or_default()
            .insert(lock_key.to_string());
        state
            .lock_waiters
            .entry(lock_key.to_string())
            .or_default()
            .insert(owner.to_string());
    }

    /// Record that `owner` stopped waiting for `lock_key` (acquired it,
    /// timed out, or gave up).
    pub fn record_wait_end(&self, owner: &str, lock_key: &str) {
        let mut state = self.state.lock();
        if let Some(waits) = state.owner_waits.get_mut(owner) {
            waits.remove(lock_key);
            if waits.is_empty() {
                state.owner_waits.remove(owner);
            }
        }
        if let Some(waiters) = state.lock_waiters.get_mut(lock_key) {
            waiters.remove(owner);
            if waiters.is_empty() {
                state.lock_waiters.remove(lock_key);
            }
        }
    }

    // ------------------------------------------------------------------
    // Detection
    // ------------------------------------------------------------------

    /// Run one detection pass: expired-owner cleanup, then cycle breaking.
    pub async fn scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);

        // Safety valve: force-release everything held past the deadline,
        // independent of whether a cycle exists.
        let expired: Vec<String> = {
            let state = self.state.lock();
            let now = Instant::now();
            state
                .owner_deadlines
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(owner, _)| owner.clone())
                .collect()
        };
        for owner in expired {
            warn!(%owner, "owner exceeded hold deadline, force-releasing its locks");
            self.force_release_owner(&owner).await;
        }

        let cycles = self.detect_cycles();
        for cycle in cycles {
            self.cycles_found.fetch_add(1, Ordering::Relaxed);
            warn!(?cycle, "deadlock cycle detected");
            let victim = {
                let state = self.state.lock();
                pick_victim(&cycle, &state.owner_locks)
            };
            if let Some(victim) = victim {
                warn!(%victim, "breaking deadlock by force-releasing victim's locks");
                self.force_release_owner(&victim).await;
            }
        }
    }

    /// Cycles currently present in the local graph.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let state = self.state.lock();
        find_cycles(&state.owner_waits, &state.lock_holders)
    }

    /// Force-release every lock `owner` holds: store-side through the wired
    /// [`ForceReleaser`], plus in-process bookkeeping. Returns the lock keys
    /// released.
    pub async fn force_release_owner(&self, owner: &str) -> Vec<String> {
        let locks: Vec<String> = {
            let mut state = self.state.lock();
            let locks = state
                .owner_locks
                .remove(owner)
                .map(|set| set.into_iter().collect::<Vec<_>>())
                .unwrap_or_default();
            for lock_key in &locks {
                if state.lock_holders.get(lock_key).map(String::as_str) == Some(owner) {
                    state.lock_holders.remove(lock_key);
                }
            }
            state.owner_deadlines.remove(owner);
            locks
        };

        let releaser = self.releaser.read().clone();
        for lock_key in &locks {
            self.forced_releases.fetch_add(1, Ordering::Relaxed);
            match &releaser {
                Some(releaser) => {
                    let removed = releaser.force_release(lock_key).await;
                    debug!(%lock_key, removed, "force-released lock");
                }
                None => {
                    warn!(%lock_key, "no force releaser wired, store-side lock left to expire");
                }
            }
        }
        locks
    }

    /// Snapshot of the graph for operational inspection.
    pub fn status(&self) -> DeadlockStatus {
        let state = self.state.lock();
        let now = Instant::now();
        DeadlockStatus {
            owner_locks: to_sorted_map(&state.owner_locks),
            owner_waits: to_sorted_map(&state.owner_waits),
            lock_holders: state.lock_holders.clone(),
            lock_waiters: to_sorted_map(&state.lock_waiters),
            owner_deadlines_ms: state
                .owner_deadlines
                .iter()
                .map(|(owner, deadline)| {
                    let remaining = deadline.saturating_duration_since(now).as_millis() as u64;
                    (owner.clone(), remaining)
                })
                .collect(),
            scans: self.scans.load(Ordering::Relaxed),
            cycles_found: self.cycles_found.load(Ordering::Relaxed),
            forced_releases: self.forced_releases.load(Ordering::Relaxed),
        }
    }
}

fn to_sorted_map(source: &HashMap<String, HashSet<String>>) -> HashMap<String, Vec<String>> {
    source
        .iter()
        .map(|(key, values)| {
            let mut values: Vec<String> = values.iter().cloned().collect();
            values.sort();
            (key.clone(), values)
        })
        .collect()
}

/// Pick the cycle member holding the fewest locks; first-found wins ties.
pub(crate) fn pick_victim(cycle: &[String], owner_locks: &HashMap<String, HashSet<String>>) -> Option<String> {
    let mut victim: Option<(&String, usize)> = None;
    for owner in cycle {
        let held = owner_locks.get(owner).map(|locks| locks.len()).unwrap_or(0);
        match victim {
            Some((_, best)) if held >= best => {}
            _ => victim = Some((owner, held)),
        }
    }
    victim.map(|(owner, _)| owner.clone())
}

/// Depth-first cycle detection over the owner wait-for graph.
///
/// An edge `A -> B` exists when A waits on a lock B holds. Every back-edge
/// into the active recursion stack yields the stack slice as a cycle.
pub(crate) fn find_cycles(
    owner_waits: &HashMap<String, HashSet<String>>,
    lock_holders: &HashMap<String, String>,
) -> Vec<Vec<String>> {
    let mut cycles = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();

    let mut roots: Vec<&String> = owner_waits.keys().collect();
    roots.sort();

    for root in roots {
        if !visited.contains(root.as_str()) {
            let mut stack: Vec<String> = Vec::new();
            let mut on_stack: HashSet<String> = HashSet::new();
            dfs(
                root,
                owner_waits,
                lock_holders,
                &mut visited,
                &mut stack,
                &mut on_stack,
                &mut cycles,
            );
        }
    }

    cycles
}

fn dfs(
    owner: &str,
    owner_waits: &HashMap<String, HashSet<String>>,
    lock_holders: &HashMap<String, String>,
    visited: &mut HashSet<String>,
    stack: &mut Vec<String>,
    on_stack: &mut HashSet<String>,
    cycles: &mut Vec<Vec<String>>,
) {
    visited.insert(owner.to_string());
    on_stack.insert(owner.to_string());
    stack.push(owner.to_string());

    if let Some(waited_locks) = owner_waits.get(owner) {
        for lock_key in waited_locks {
            let Some(holder) = lock_holders.get(lock_key) else {
                continue;
            };
            if holder == owner {
                // Waiting on a lock we already hold is reentrancy, not deadlock.
                continue;
            }
            if !visited.contains(holder) {
                dfs(holder, owner_waits, lock_holders, visited, stack, on_stack, cycles);
            } else if on_stack.contains(holder) {
                if let Some(position) = stack.iter().position(|entry| entry == holder) {
                    cycles.push(stack[position..].to_vec());
                }
            }
        }
    }

    stack.pop();
    on_stack.remove(owner);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct RecordingReleaser {
        released: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ForceReleaser for RecordingReleaser {
        async fn force_release(&self, lock_key: &str) -> bool {
            self.released.lock().push(lock_key.to_string());
            true
        }
    }

    fn detector() -> DeadlockDetector {
        DeadlockDetector::new(DetectorConfig::default())
    }

    #[test]
    fn test_no_cycle_on_simple_wait() {
        let detector = detector();
        detector.record_lock_acquired("a", "lock:x");
        detector.record_wait_start("b", "lock:x");

        assert!(detector.detect_cycles().is_empty());
    }

    #[test]
    fn test_two_owner_cycle_detected() {
        let detector = detector();
        detector.record_lock_acquired("a", "lock:x");
        detector.record_lock_acquired("b", "lock:y");
        detector.record_wait_start("a", "lock:y");
        detector.record_wait_start("b", "lock:x");

        let cycles = detector.detect_cycles();
        assert_eq!(cycles.len(), 1);
        let cycle: HashSet<&str> = cycles[0].iter().map(String::as_str).collect();
        assert_eq!(cycle, HashSet::from(["a", "b"]));
    }

    #[test]
    fn test_three_owner_cycle_detected() {
        let detector = detector();
        detector.record_lock_acquired("a", "lock:x");
        detector.record_lock_acquired("b", "lock:y");
        detector.record_lock_acquired("c", "lock:z");
        detector.record_wait_start("a", "lock:y");
        detector.record_wait_start("b", "lock:z");
        detector.record_wait_start("c", "lock:x");

        let cycles = detector.detect_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 3);
    }

    #[test]
    fn test_reentrant_wait_is_not_a_cycle() {
        let detector = detector();
        detector.record_lock_acquired("a", "lock:x");
        detector.record_wait_start("a", "lock:x");

        assert!(detector.detect_cycles().is_empty());
    }

    #[test]
    fn test_wait_end_clears_the_edge() {
        let detector = detector();
        detector.record_lock_acquired("a", "lock:x");
        detector.record_lock_acquired("b", "lock:y");
        detector.record_wait_start("a", "lock:y");
        detector.record_wait_start("b", "lock:x");
        detector.record_wait_end("b", "lock:x");

        assert!(detector.detect_cycles().is_empty());
    }

    #[test]
    fn test_victim_holds_fewest_locks() {
        let mut owner_locks: HashMap<String, HashSet<String>> = HashMap::new();
        owner_locks.insert("a".into(), HashSet::from(["l1".into(), "l2".into()]));
        owner_locks.insert("b".into(), HashSet::from(["l3".into()]));

        let cycle = vec!["a".to_string(), "b".to_string()];
        assert_eq!(pick_victim(&cycle, &owner_locks), Some("b".to_string()));
    }

    #[test]
    fn test_victim_tie_breaks_first_found() {
        let mut owner_locks: HashMap<String, HashSet<String>> = HashMap::new();
        owner_locks.insert("a".into(), HashSet::from(["l1".into()]));
        owner_locks.insert("b".into(), HashSet::from(["l2".into()]));

        let cycle = vec!["b".to_string(), "a".to_string()];
        assert_eq!(pick_victim(&cycle, &owner_locks), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_scan_breaks_cycle_through_releaser() {
        let detector = detector();
        let releaser = Arc::new(RecordingReleaser::default());
        detector.set_force_releaser(releaser.clone());

        detector.record_lock_acquired("a", "lock:x");
        detector.record_lock_acquired("a", "lock:extra");
        detector.record_lock_acquired("b", "lock:y");
        detector.record_wait_start("a", "lock:y");
        detector.record_wait_start("b", "lock:x");

        detector.scan().await;

        // b holds fewer locks, so b is the victim.
        let released = releaser.released.lock().clone();
        assert_eq!(released, vec!["lock:y".to_string()]);

        // The cycle is gone from the graph.
        assert!(detector.detect_cycles().is_empty());
        let status = detector.status();
        assert_eq!(status.cycles_found, 1);
        assert!(!status.owner_locks.contains_key("b"));
    }

    #[tokio::test]
    async fn test_deadline_cleanup_force_releases() {
        let mut config = DetectorConfig::default();
        config.owner_deadline = std::time::Duration::from_millis(10);
        let detector = DeadlockDetector::new(config);
        let releaser = Arc::new(RecordingReleaser::default());
        detector.set_force_releaser(releaser.clone());

        detector.record_lock_acquired("slow", "lock:x");
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        detector.scan().await;

        assert_eq!(releaser.released.lock().clone(), vec!["lock:x".to_string()]);
        assert!(detector.status().owner_locks.is_empty());
    }

    #[test]
    fn test_status_snapshot() {
        let detector = detector();
        detector.record_lock_acquired("a", "lock:x");
        detector.record_wait_start("b", "lock:x");

        let status = detector.status();
        assert_eq!(status.owner_locks["a"], vec!["lock:x".to_string()]);
        assert_eq!(status.lock_holders["lock:x"], "a");
        assert_eq!(status.lock_waiters["lock:x"], vec!["b".to_string()]);
        assert!(status.owner_deadlines_ms.contains_key("a"));
    }
}
