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

//! Facade unifying the three lock flavors.
//!
//! Routes every operation to the matching service via [`LockKind`], wires the
//! deadlock detector's force-release path into the reentrant service, and
//! exposes the monitor and detector snapshots for dashboards.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lockstep_store::KeyValueStore;

use crate::config::{DetectorConfig, LockConfig};
use crate::deadlock::DeadlockDetector;
use crate::error::Result;
use crate::fair::FairLockService;
use crate::monitor::{LockMetrics, LockPerformanceMonitor};
use crate::reentrant::ReentrantLockService;
use crate::rwlock::ReadWriteLockService;
use crate::types::{DeadlockStatus, LockKind};

/// Unified entry point for application code.
#[derive(Debug)]
pub struct LockManager {
    reentrant: Arc<ReentrantLockService>,
    rw: Arc<ReadWriteLockService>,
    fair: Arc<FairLockService>,
    monitor: Arc<LockPerformanceMonitor>,
    detector: Arc<DeadlockDetector>,
}

impl LockManager {
    /// Build the manager with all services sharing one store, monitor and
    /// detector. Starts the renewal watchdog and the detector's scan task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(store: Arc<dyn KeyValueStore>, config: LockConfig, detector_config: DetectorConfig) -> Result<Arc<Self>> {
        config.validate()?;
        detector_config.validate()?;

        let monitor = Arc::new(LockPerformanceMonitor::new());
        let detector = Arc::new(DeadlockDetector::new(detector_config));
        let reentrant = ReentrantLockService::new(store.clone(), config.clone(), monitor.clone(), Some(detector.clone()));
        detector.set_force_releaser(reentrant.clone());
        detector.start();

        let rw = Arc::new(ReadWriteLockService::new(
            store.clone(),
            config.clone(),
            monitor.clone(),
            Some(detector.clone()),
        ));
        let fair = Arc::new(FairLockService::new(store, config, reentrant.clone(), monitor.clone()));

        Ok(Arc::new(Self {
            reentrant,
            rw,
            fair,
            monitor,
            detector,
        }))
    }

    /// The shared deadlock detector, for wiring a distributed layer on top.
    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    /// The reentrant service, for callers that want the concrete API.
    pub fn reentrant(&self) -> &Arc<ReentrantLockService> {
        &self.reentrant
    }

    /// Stop background tasks (watchdog, detector scans).
    pub fn shutdown(&self) {
        self.reentrant.shutdown();
        self.detector.stop();
    }

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    /// Non-blocking reentrant acquisition.
    pub async fn try_lock(&self, owner: &str, lock_name: &str, key: &str, ttl: Duration) -> Result<Option<String>> {
        self.reentrant.try_lock(owner, lock_name, key, ttl).await
    }

    /// Non-blocking shared acquisition.
    pub async fn try_read_lock(&self, owner: &str, lock_name: &str, key: &str, ttl: Duration) -> Result<Option<String>> {
        self.rw.try_read_lock(owner, lock_name, key, ttl).await
    }

    /// Non-blocking exclusive acquisition.
    pub async fn try_write_lock(&self, owner: &str, lock_name: &str, key: &str, ttl: Duration) -> Result<Option<String>> {
        self.rw.try_write_lock(owner, lock_name, key, ttl).await
    }

    /// Blocking acquisition of the given kind, waiting up to `wait_timeout`.
    pub async fn lock(
        &self,
        owner: &str,
        lock_name: &str,
        key: &str,
        ttl: Duration,
        wait_timeout: Duration,
        kind: LockKind,
    ) -> Result<Option<String>> {
        match kind {
            LockKind::Reentrant => self.reentrant.lock(owner, lock_name, key, ttl, wait_timeout).await,
            LockKind::Read => self.rw.read_lock(owner, lock_name, key, ttl, wait_timeout).await,
            LockKind::Write => self.rw.write_lock(owner, lock_name, key, ttl, wait_timeout).await,
            LockKind::Fair => self.fair.lock(owner, lock_name, key, ttl, wait_timeout).await,
        }
    }

    // ------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------

    /// Release a reentrant or fair lock.
    pub async fn unlock(&self, owner: &str, lock_name: &str, key: &str, token: &str) -> Result<bool> {
        self.reentrant.unlock(owner, lock_name, key, token).await
    }

    /// Release a shared lock.
    pub async fn release_read_lock(&self, owner: &str, lock_name: &str, key: &str, token: &str) -> Result<bool> {
        self.rw.release_read_lock(owner, lock_name, key, token).await
    }

    /// Release an exclusive lock.
    pub async fn release_write_lock(&self, owner: &str, lock_name: &str, key: &str, token: &str) -> Result<bool> {
        self.rw.release_write_lock(owner, lock_name, key, token).await
    }

    // ------------------------------------------------------------------
    // Scoped helpers
    // ------------------------------------------------------------------

    /// Run `action` under the reentrant lock; `None` when never acquired.
    pub async fn execute_with_lock<F, Fut, T>(&self, owner: &str, lock_name: &str, key: &str, action: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.reentrant.execute_with_lock(owner, lock_name, key, action).await
    }

    /// Run `action` under a shared lock; `None` when never acquired.
    pub async fn execute_with_read_lock<F, Fut, T>(
        &self,
        owner: &str,
        lock_name: &str,
        key: &str,
        action: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let config = self.reentrant.config();
        let Some(token) = self
            .rw
            .read_lock(owner, lock_name, key, config.default_ttl, config.default_wait_timeout)
            .await?
        else {
            return Ok(None);
        };
        let output = action().await;
        self.rw.release_read_lock(owner, lock_name, key, &token).await?;
        Ok(Some(output))
    }

    /// Run `action` under the exclusive lock; `None` when never acquired.
    pub async fn execute_with_write_lock<F, Fut, T>(
        &self,
        owner: &str,
        lock_name: &str,
        key: &str,
        action: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let config = self.reentrant.config();
        let Some(token) = self
            .rw
            .write_lock(owner, lock_name, key, config.default_ttl, config.default_wait_timeout)
            .await?
        else {
            return Ok(None);
        };
        let output = action().await;
        self.rw.release_write_lock(owner, lock_name, key, &token).await?;
        Ok(Some(output))
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// Statistics for one lock name.
    pub fn lock_stats(&self, lock_name: &str) -> Option<LockMetrics> {
        self.monitor.stats(lock_name)
    }

    /// Statistics for every lock name.
    pub fn all_lock_stats(&self) -> std::collections::HashMap<String, LockMetrics> {
        self.monitor.all_stats()
    }

    /// Aggregate statistics across all lock names.
    pub fn global_stats(&self) -> LockMetrics {
        self.monitor.global_stats()
    }

    /// Snapshot of the local wait-for graph.
    pub fn deadlock_status(&self) -> DeadlockStatus {
        self.detector.status()
    }

    /// Drop statistics for one lock name.
    pub fn reset_stats(&self, lock_name: &str) -> bool {
        self.monitor.reset(lock_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_store::MemoryStore;

    fn manager() -> Arc<LockManager> {
        let config = LockConfig {
            node_id: "node-1".to_string(),
            retry_interval: Duration::from_millis(10),
            ..LockConfig::default()
        };
        LockManager::new(Arc::new(MemoryStore::new()), config, DetectorConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_kind_dispatch() {
        let manager = manager();
        let ttl = Duration::from_secs(10);
        let wait = Duration::from_millis(100);

        let reentrant = manager.lock("w1", "a", "1", ttl, wait, LockKind::Reentrant).await.unwrap();
        assert!(reentrant.is_some());

        let read = manager.lock("w1", "b", "1", ttl, wait, LockKind::Read).await.unwrap();
        assert!(read.is_some());

        let fair = manager.lock("w1", "c", "1", ttl, wait, LockKind::Fair).await.unwrap();
        assert!(fair.is_some());

        // Write lock on a key with readers must fail.
        let write = manager.lock("w2", "b", "1", ttl, wait, LockKind::Write).await.unwrap();
        assert!(write.is_none());
    }

    #[tokio::test]
    async fn test_stats_flow_through_manager() {
        let manager = manager();
        let ttl = Duration::from_secs(10);

        let token = manager.try_lock("w1", "orders", "1", ttl).await.unwrap().unwrap();
        assert!(manager.try_lock("w2", "orders", "1", ttl).await.unwrap().is_none());
        assert!(manager.unlock("w1", "orders", "1", &token).await.unwrap());

        let stats = manager.lock_stats("orders").unwrap();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.releases, 1);

        assert!(manager.reset_stats("orders"));
        assert!(manager.lock_stats("orders").is_none());
        assert_eq!(manager.global_stats().attempts, 0);
    }

    #[tokio::test]
    async fn test_deadlock_status_reflects_holders() {
        let manager = manager();
        let ttl = Duration::from_secs(10);

        let _token = manager.try_lock("w1", "orders", "1", ttl).await.unwrap().unwrap();
        let status = manager.deadlock_status();
        assert_eq!(status.lock_holders.get("lock:orders:1").map(String::as_str), Some("w1"));
    }

    #[tokio::test]
    async fn test_execute_with_write_lock() {
        let manager = manager();
        let result = manager
            .execute_with_write_lock("w1", "cfg", "1", || async { "updated" })
            .await
            .unwrap();
        assert_eq!(result, Some("updated"));

        // Lock is free again afterwards.
        assert!(
            manager
                .try_write_lock("w2", "cfg", "1", Duration::from_secs(5))
                .await
                .unwrap()
                .is_some()
        );
    }
}
