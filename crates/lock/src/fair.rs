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

//! Approximately-FIFO lock service.
//!
//! A queue key at `{key}:queue` orders waiters: only the ticket at the front
//! may take the lock, so arrival order decides grant eligibility. The
//! ordering is best-effort — a waiter that times out removes its ticket and
//! later arrivals move up, and nothing is guaranteed across a store failover.
//!
//! Granted locks share the reentrant service's bookkeeping, so renewal and
//! release behave exactly like a reentrant lock.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use lockstep_store::{AtomicCommand, KeyValueStore};

use crate::config::LockConfig;
use crate::error::{LockError, Result};
use crate::monitor::LockPerformanceMonitor;
use crate::reentrant::ReentrantLockService;
use crate::types::LockToken;

/// Upper bound on a single sleep between front-of-queue checks.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Fair (approximately-FIFO) lock service backed by the shared store.
#[derive(Debug)]
pub struct FairLockService {
    store: Arc<dyn KeyValueStore>,
    config: LockConfig,
    reentrant: Arc<ReentrantLockService>,
    monitor: Arc<LockPerformanceMonitor>,
}

impl FairLockService {
    /// Create the service. Granted locks register with `reentrant` so the
    /// shared watchdog renews them.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: LockConfig,
        reentrant: Arc<ReentrantLockService>,
        monitor: Arc<LockPerformanceMonitor>,
    ) -> Self {
        Self {
            store,
            config,
            reentrant,
            monitor,
        }
    }

    fn lock_key(&self, lock_name: &str, key: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, lock_name, key)
    }

    fn queue_key(&self, lock_name: &str, key: &str) -> String {
        format!("{}:queue", self.lock_key(lock_name, key))
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

    /// Try to acquire without blocking: join the queue, take the lock only if
    /// we landed at the front and it is free, and leave the queue otherwise.
    pub async fn try_lock(&self, owner: &str, lock_name: &str, key: &str, ttl: Duration) -> Result<Option<String>> {
        self.validate_call(owner, lock_name, key)?;
        self.monitor.record_attempt(lock_name);

        let lock_key = self.lock_key(lock_name, key);
        if let Some(token) = self.reentrant.reenter(owner, &lock_key) {
            self.monitor.record_success(lock_name, Duration::ZERO);
            return Ok(Some(token));
        }

        let token = LockToken::generate(&self.config.node_id, owner).to_string();
        match self.attempt(lock_name, key, &token, ttl).await {
            Ok(true) => {
                self.reentrant.register_granted(owner, lock_name, &lock_key, &token, ttl);
                self.monitor.record_success(lock_name, Duration::ZERO);
                debug!(lock_name, key, owner, "fair lock acquired");
                Ok(Some(token))
            }
            Ok(false) => {
                self.leave_queue(lock_name, key, &token).await;
                self.monitor.record_failure(lock_name);
                Ok(None)
            }
            Err(err) => {
                warn!(lock_name, key, error = %err, "store error during fair acquisition");
                self.leave_queue(lock_name, key, &token).await;
                self.monitor.record_failure(lock_name);
                Ok(None)
            }
        }
    }

    /// Acquire, holding a queue position and polling for our turn until
    /// `wait_timeout` elapses.
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

        let lock_key = self.lock_key(lock_name, key);
        if let Some(token) = self.reentrant.reenter(owner, &lock_key) {
            self.monitor.record_success(lock_name, Duration::ZERO);
            return Ok(Some(token));
        }

        let token = LockToken::generate(&self.config.node_id, owner).to_string();
        let deadline = started + wait_timeout;
        loop {
            match self.attempt(lock_name, key, &token, ttl).await {
                Ok(true) => {
                    self.reentrant.register_granted(owner, lock_name, &lock_key, &token, ttl);
                    self.monitor.record_success(lock_name, started.elapsed());
                    debug!(lock_name, key, owner, "fair lock acquired");
                    return Ok(Some(token));
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(lock_name, key, error = %err, "store error while queued, retrying");
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let slice = self.config.retry_interval.min(MAX_WAIT_SLICE).min(deadline - now);
            tokio::time::sleep(slice).await;
        }

        // Timed out: surrender the queue position so later waiters move up.
        self.leave_queue(lock_name, key, &token).await;
        self.monitor.record_failure(lock_name);
        Ok(None)
    }

    /// Release a fair lock. Delegates to the reentrant service, so nested
    /// acquisitions and token verification behave identically.
    pub async fn unlock(&self, owner: &str, lock_name: &str, key: &str, token: &str) -> Result<bool> {
        self.reentrant.unlock(owner, lock_name, key, token).await
    }

    /// One queue round-trip: ensure we are enqueued, then take the lock if we
    /// head the queue and it is free.
    async fn attempt(&self, lock_name: &str, key: &str, ticket: &str, ttl: Duration) -> Result<bool> {
        let queue_key = self.queue_key(lock_name, key);
        // Re-enqueueing is idempotent and refreshes the queue's TTL while we
        // keep waiting.
        self.store
            .execute(AtomicCommand::EnqueueWaiter {
                queue_key: queue_key.clone(),
                ticket: ticket.to_string(),
                ttl: self.config.default_ttl,
            })
            .await?;

        let reply = self
            .store
            .execute(AtomicCommand::AcquireIfFront {
                queue_key,
                ticket: ticket.to_string(),
                lock_key: self.lock_key(lock_name, key),
                value: ticket.to_string(),
                ttl,
            })
            .await?;
        Ok(reply.acquired())
    }

    async fn leave_queue(&self, lock_name: &str, key: &str, ticket: &str) {
        let command = AtomicCommand::RemoveWaiter {
            queue_key: self.queue_key(lock_name, key),
            ticket: ticket.to_string(),
        };
        if let Err(err) = self.store.execute(command).await {
            warn!(lock_name, key, error = %err, "failed to leave lock queue, ticket left to expire");
        }
    }
}
