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

//! Reentrant distributed lock service.
//!
//! Mutual exclusion over the shared store with per-owner reentrancy, waiter
//! wake-up, and a background renewal watchdog. Acquisition failure and
//! release-after-loss are routine outcomes reported through `Ok(None)` /
//! `Ok(false)`; store faults are absorbed at this boundary and treated as
//! acquisition failure (fail-closed).

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use lockstep_store::{AtomicCommand, KeyValueStore};

use crate::config::LockConfig;
use crate::deadlock::{DeadlockDetector, ForceReleaser};
use crate::error::{LockError, Result};
use crate::monitor::LockPerformanceMonitor;
use crate::types::{HeldLock, LockToken, ReentrantEntry};

/// Upper bound on a single park between acquisition attempts.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Reentrant lock service backed by the shared store.
#[derive(Debug)]
pub struct ReentrantLockService {
    store: Arc<dyn KeyValueStore>,
    config: LockConfig,
    /// (owner, lock_key) -> reentrancy bookkeeping
    reentrants: DashMap<(String, String), ReentrantEntry>,
    /// lock_key -> node-global held-lock record, scanned by the watchdog
    held: Arc<DashMap<String, HeldLock>>,
    /// lock_key -> wake handle for parked waiters
    waiters: Arc<DashMap<String, Arc<Notify>>>,
    monitor: Arc<LockPerformanceMonitor>,
    detector: Option<Arc<DeadlockDetector>>,
    shutdown: Arc<AtomicBool>,
}

impl ReentrantLockService {
    /// Create the service and start its renewal watchdog.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: LockConfig,
        monitor: Arc<LockPerformanceMonitor>,
        detector: Option<Arc<DeadlockDetector>>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            store,
            config,
            reentrants: DashMap::new(),
            held: Arc::new(DashMap::new()),
            waiters: Arc::new(DashMap::new()),
            monitor,
            detector,
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        service.spawn_watchdog();
        service
    }

    /// Service configuration
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Stop the renewal watchdog.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Full store key for a lock: `{prefix}:{name}:{business_key}`.
    pub fn lock_key(&self, lock_name: &str, key: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, lock_name, key)
    }

    fn validate_call(&self, owner: &str, lock_name: &str, key: &str) -> Result<()> {
        if owner.is_empty() || owner.contains(':') {
            return Err(LockError::invalid_argument("owner must be non-empty and must not contain ':'"));
        }
        if lock_name.is_empty() || key.is_empty() {
            return Err(LockError::invalid_argument("lock name and key must not be empty"));
        }
        Ok(())
    }

    /// Try to acquire without blocking.
    ///
    /// Returns the holder token on success, `None` when the lock is held by
    /// someone else or the store could not confirm the acquisition.
    pub async fn try_lock(&self, owner: &str, lock_name: &str, key: &str, ttl: Duration) -> Result<Option<String>> {
        self.validate_call(owner, lock_name, key)?;
        self.monitor.record_attempt(lock_name);
        let acquired = self.try_acquire(owner, lock_name, key, ttl).await?;
        match &acquired {
            Some(_) => self.monitor.record_success(lock_name, Duration::ZERO),
            None => self.monitor.record_failure(lock_name),
        }
        Ok(acquired)
    }

    /// Acquire, parking between bounded polling attempts until `wait_timeout`
    /// elapses. Dropping the returned future abandons the wait; callers treat
    /// that the same as a timeout.
    pub async fn lock(
        &self,
        owner: &str,
        lock_name: &str,
        key: &str,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> Result<Option<String>> {
        self.validate_call(owner, lock_name, key)?;
        self.monitor.record_attempt(lock_name);
        let started = Instant::now();

        if let Some(token) = self.try_acquire(owner, lock_name, key, ttl).await? {
            self.monitor.record_success(lock_name, started.elapsed());
            return Ok(Some(token));
        }

        let lock_key = self.lock_key(lock_name, key);
        let notify = self
            .waiters
            .entry(lock_key.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        if let Some(detector) = &self.detector {
            detector.record_wait_start(owner, &lock_key);
        }

        let deadline = started + wait_timeout;
        let mut acquired = None;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let slice = self
                .config
                .retry_interval
                .min(MAX_WAIT_SLICE)
                .min(deadline - now);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(slice) => {}
            }
            if let Some(token) = self.try_acquire(owner, lock_name, key, ttl).await? {
                acquired = Some(token);
                break;
            }
        }

        if let Some(detector) = &self.detector {
            detector.record_wait_end(owner, &lock_key);
        }
        match &acquired {
            Some(_) => self.monitor.record_success(lock_name, started.elapsed()),
            None => self.monitor.record_failure(lock_name),
        }
        Ok(acquired)
    }

    /// Release a previously acquired lock.
    ///
    /// Returns `false` when the token no longer owns the store-side entry
    /// (expired, or taken over after expiry); that is a routine outcome, not
    /// an error.
    pub async fn unlock(&self, owner: &str, lock_name: &str, key: &str, token: &str) -> Result<bool> {
        self.validate_call(owner, lock_name, key)?;
        let lock_key = self.lock_key(lock_name, key);
        let reentrant_key = (owner.to_string(), lock_key.clone());

        // Nested release never touches the store.
        if let Some(mut entry) = self.reentrants.get_mut(&reentrant_key) {
            if entry.count > 1 {
                entry.count -= 1;
                debug!(%lock_key, count = entry.count, "reentrant release");
                return Ok(true);
            }
        }

        let reply = match self
            .store
            .execute(AtomicCommand::DeleteIfEquals {
                key: lock_key.clone(),
                expected: token.to_string(),
            })
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%lock_key, error = %err, "store error during unlock");
                return Ok(false);
            }
        };

        if !reply.deleted() {
            debug!(%lock_key, "unlock rejected, token no longer owns the lock");
            return Ok(false);
        }

        self.reentrants.remove(&reentrant_key);
        if let Some((_, held)) = self.held.remove(&lock_key) {
            self.monitor.record_release(lock_name, held.acquired_at.elapsed());
        }
        if let Some(detector) = &self.detector {
            detector.record_lock_released(owner, &lock_key);
        }
        self.wake_waiters(&lock_key);
        debug!(%lock_key, owner, "lock released");
        Ok(true)
    }

    /// Acquire, run `action`, release on every exit path.
    ///
    /// Returns `None` when the lock was never acquired; the action does not
    /// run in that case.
    pub async fn execute_with_lock<F, Fut, T>(&self, owner: &str, lock_name: &str, key: &str, action: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(token) = self.try_lock(owner, lock_name, key, self.config.default_ttl).await? else {
            return Ok(None);
        };
        let output = action().await;
        let released = self.unlock(owner, lock_name, key, &token).await?;
        if !released {
            warn!(lock_name, key, "lock expired before the critical section finished");
        }
        Ok(Some(output))
    }

    /// Like [`execute_with_lock`](Self::execute_with_lock), but waits up to
    /// `wait_timeout` for the lock.
    pub async fn execute_with_lock_wait<F, Fut, T>(
        &self,
        owner: &str,
        lock_name: &str,
        key: &str,
        wait_timeout: Duration,
        action: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(token) = self
            .lock(owner, lock_name, key, self.config.default_ttl, wait_timeout)
            .await?
        else {
            return Ok(None);
        };
        let output = action().await;
        let released = self.unlock(owner, lock_name, key, &token).await?;
        if !released {
            warn!(lock_name, key, "lock expired before the critical section finished");
        }
        Ok(Some(output))
    }

    /// Release the lock at `lock_key` regardless of who holds it, clearing
    /// node-local bookkeeping. Used by the deadlock detector to break cycles.
    pub async fn force_unlock(&self, lock_key: &str) -> bool {
        let removed = match self.store.delete(lock_key).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(%lock_key, error = %err, "store error during force unlock, lease left to expire");
                false
            }
        };
        self.held.remove(lock_key);
        self.reentrants.retain(|_, entry| entry.lock_key != lock_key);
        self.wake_waiters(lock_key);
        removed
    }

    /// Reentrancy fast path shared with the fair lock: bump the nesting count
    /// when `owner` already holds `lock_key` and return the existing token.
    pub(crate) fn reenter(&self, owner: &str, lock_key: &str) -> Option<String> {
        let reentrant_key = (owner.to_string(), lock_key.to_string());
        self.reentrants.get_mut(&reentrant_key).map(|mut entry| {
            entry.count += 1;
            entry.token.clone()
        })
    }

    /// Record bookkeeping for a lock granted outside this service's own
    /// acquisition path (the fair lock's queue grant).
    pub(crate) fn register_granted(&self, owner: &str, lock_name: &str, lock_key: &str, token: &str, ttl: Duration) {
        let now = Instant::now();
        self.reentrants.insert(
            (owner.to_string(), lock_key.to_string()),
            ReentrantEntry {
                lock_key: lock_key.to_string(),
                token: token.to_string(),
                count: 1,
            },
        );
        self.held.insert(
            lock_key.to_string(),
            HeldLock {
                lock_name: lock_name.to_string(),
                lock_key: lock_key.to_string(),
                token: token.to_string(),
                ttl,
                acquired_at: now,
                last_renewed: now,
            },
        );
        if let Some(detector) = &self.detector {
            detector.record_lock_acquired(owner, lock_key);
        }
    }

    async fn try_acquire(&self, owner: &str, lock_name: &str, key: &str, ttl: Duration) -> Result<Option<String>> {
        let lock_key = self.lock_key(lock_name, key);

        if let Some(token) = self.reenter(owner, &lock_key) {
            debug!(%lock_key, owner, "reentrant acquisition");
            return Ok(Some(token));
        }

        let token = LockToken::generate(&self.config.node_id, owner).to_string();
        let reply = match self
            .store
            .execute(AtomicCommand::SetIfAbsent {
                key: lock_key.clone(),
                value: token.clone(),
                ttl,
            })
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                // Fail closed: unable to confirm the acquisition means we do
                // not have the lock.
                warn!(%lock_key, error = %err, "store error during acquisition");
                return Ok(None);
            }
        };

        if !reply.acquired() {
            return Ok(None);
        }

        self.register_granted(owner, lock_name, &lock_key, &token, ttl);
        debug!(%lock_key, owner, "lock acquired");
        Ok(Some(token))
    }

    fn wake_waiters(&self, lock_key: &str) {
        if let Some((_, notify)) = self.waiters.remove(lock_key) {
            notify.notify_waiters();
        }
    }

    fn spawn_watchdog(&self) {
        let held = self.held.clone();
        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        let renew_interval = self.config.renew_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renew_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    debug!("renewal watchdog shutting down");
                    break;
                }

                let due: Vec<HeldLock> = held
                    .iter()
                    .filter(|entry| entry.renewal_due())
                    .map(|entry| entry.value().clone())
                    .collect();

                for lock in due {
                    let Some(token) = LockToken::parse(&lock.token) else {
                        warn!(lock_key = %lock.lock_key, "malformed lock token, skipping renewal");
                        continue;
                    };
                    let command = AtomicCommand::ExtendIfPrefix {
                        key: lock.lock_key.clone(),
                        prefix: token.renew_prefix(),
                        ttl: lock.ttl,
                    };
                    match store.execute(command).await {
                        Ok(reply) if reply.extended() => {
                            if let Some(mut entry) = held.get_mut(&lock.lock_key) {
                                entry.last_renewed = Instant::now();
                            }
                            debug!(lock_key = %lock.lock_key, "lease renewed");
                        }
                        Ok(_) => {
                            // The entry expired or was taken over; stop
                            // renewing so the next acquisition starts clean.
                            warn!(lock_key = %lock.lock_key, "renewal rejected, dropping held-lock record");
                            held.remove(&lock.lock_key);
                        }
                        Err(err) => {
                            warn!(lock_key = %lock.lock_key, error = %err, "renewal failed, will retry next pass");
                        }
                    }
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl ForceReleaser for ReentrantLockService {
    async fn force_release(&self, lock_key: &str) -> bool {
        self.force_unlock(lock_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_store::MemoryStore;

    fn config() -> LockConfig {
        LockConfig {
            node_id: "node-1".to_string(),
            retry_interval: Duration::from_millis(10),
            ..LockConfig::default()
        }
    }

    fn service_with(store: Arc<dyn KeyValueStore>, config: LockConfig) -> Arc<ReentrantLockService> {
        ReentrantLockService::new(store, config, Arc::new(LockPerformanceMonitor::new()), None)
    }

    fn service() -> Arc<ReentrantLockService> {
        service_with(Arc::new(MemoryStore::new()), config())
    }

    #[tokio::test]
    async fn test_try_lock_and_contention() {
        let service = service();
        let ttl = Duration::from_secs(10);

        let token = service.try_lock("w1", "orders", "123", ttl).await.unwrap();
        assert!(token.is_some());

        let contender = service.try_lock("w2", "orders", "123", ttl).await.unwrap();
        assert!(contender.is_none());

        assert!(service.unlock("w1", "orders", "123", &token.unwrap()).await.unwrap());
        let retry = service.try_lock("w2", "orders", "123", ttl).await.unwrap();
        assert!(retry.is_some());
    }

    #[tokio::test]
    async fn test_reentrancy_requires_matching_releases() {
        let service = service();
        let ttl = Duration::from_secs(10);

        let first = service.try_lock("w1", "orders", "1", ttl).await.unwrap().unwrap();
        let second = service.try_lock("w1", "orders", "1", ttl).await.unwrap().unwrap();
        assert_eq!(first, second);

        // Another owner stays locked out through the whole window.
        assert!(service.try_lock("w2", "orders", "1", ttl).await.unwrap().is_none());

        // First release only decrements.
        assert!(service.unlock("w1", "orders", "1", &first).await.unwrap());
        assert!(service.try_lock("w2", "orders", "1", ttl).await.unwrap().is_none());

        // Second release drops the store entry.
        assert!(service.unlock("w1", "orders", "1", &first).await.unwrap());
        assert!(service.try_lock("w2", "orders", "1", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unlock_with_wrong_token_fails() {
        let service = service();
        let ttl = Duration::from_secs(10);

        let token = service.try_lock("w1", "orders", "1", ttl).await.unwrap().unwrap();
        assert!(!service.unlock("w1", "orders", "1", "node-1:w1:bogus").await.unwrap());
        assert!(service.unlock("w1", "orders", "1", &token).await.unwrap());
        // Releasing again reports the loss.
        assert!(!service.unlock("w1", "orders", "1", &token).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_waits_for_release() {
        let service = service();
        let ttl = Duration::from_secs(10);

        let token = service.try_lock("w1", "orders", "1", ttl).await.unwrap().unwrap();

        let waiter = service.clone();
        let handle = tokio::spawn(async move {
            waiter
                .lock("w2", "orders", "1", ttl, Duration::from_secs(2))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.unlock("w1", "orders", "1", &token).await.unwrap());

        let acquired = handle.await.unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test]
    async fn test_lock_times_out_under_contention() {
        let service = service();
        let ttl = Duration::from_secs(10);

        let _token = service.try_lock("w1", "orders", "1", ttl).await.unwrap().unwrap();
        let started = Instant::now();
        let result = service
            .lock("w2", "orders", "1", ttl, Duration::from_millis(150))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_watchdog_renews_before_expiry() {
        let mut cfg = config();
        cfg.renew_interval = Duration::from_millis(20);
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let service = service_with(store.clone(), cfg);

        let ttl = Duration::from_millis(120);
        let token = service.try_lock("w1", "orders", "1", ttl).await.unwrap().unwrap();

        // Held well past the original TTL, the store entry must survive.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let value = store.get(&service.lock_key("orders", "1")).await.unwrap();
        assert_eq!(value, Some(token));
    }

    #[tokio::test]
    async fn test_crashed_holder_lease_lapses() {
        let mut cfg = config();
        cfg.renew_interval = Duration::from_millis(20);
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let service = service_with(store.clone(), cfg);

        let ttl = Duration::from_millis(80);
        service.try_lock("w1", "orders", "1", ttl).await.unwrap().unwrap();

        // Simulate the holder crashing: its watchdog stops renewing.
        service.shutdown();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let takeover = service.try_lock("w2", "orders", "1", Duration::from_secs(5)).await.unwrap();
        assert!(takeover.is_some());
    }

    #[tokio::test]
    async fn test_execute_with_lock_releases() {
        let service = service();

        let ran = service
            .execute_with_lock("w1", "orders", "1", || async { 42 })
            .await
            .unwrap();
        assert_eq!(ran, Some(42));

        // The lock is free again afterwards.
        let token = service.try_lock("w2", "orders", "1", Duration::from_secs(5)).await.unwrap();
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn test_execute_with_lock_skips_action_under_contention() {
        let service = service();
        let _token = service
            .try_lock("w1", "orders", "1", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        let ran = service
            .execute_with_lock("w2", "orders", "1", || async { 42 })
            .await
            .unwrap();
        assert_eq!(ran, None);
    }

    #[tokio::test]
    async fn test_force_unlock_clears_holder() {
        let service = service();
        let ttl = Duration::from_secs(10);
        service.try_lock("w1", "orders", "1", ttl).await.unwrap().unwrap();

        let lock_key = service.lock_key("orders", "1");
        assert!(service.force_unlock(&lock_key).await);
        assert!(service.try_lock("w2", "orders", "1", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_programming_errors() {
        let service = service();
        assert!(service.try_lock("a:b", "orders", "1", Duration::from_secs(1)).await.is_err());
        assert!(service.try_lock("", "orders", "1", Duration::from_secs(1)).await.is_err());
        assert!(service.try_lock("w1", "", "1", Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_try_lock_single_winner() {
        let service = service();
        let ttl = Duration::from_secs(10);

        let mut handles = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.try_lock(&format!("w{i}"), "orders", "hot", ttl).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
