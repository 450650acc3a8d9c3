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

//! Shared/exclusive locking over two store keys per lock name: a hash of
//! concurrent readers at `{key}:read` and a single exclusive value at
//! `{key}:write`. Check-and-write happens in one atomic command, so the
//! existence check can never race the write.
//!
//! Readers and writers compete equally while waiting; starvation of either
//! side is a known, accepted limitation.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use lockstep_store::{AtomicCommand, KeyValueStore};

use crate::config::LockConfig;
use crate::deadlock::DeadlockDetector;
use crate::error::{LockError, Result};
use crate::monitor::LockPerformanceMonitor;
use crate::types::LockToken;

/// Upper bound on a single sleep between acquisition attempts.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Read-write lock service backed by the shared store.
#[derive(Debug)]
pub struct ReadWriteLockService {
    store: Arc<dyn KeyValueStore>,
    config: LockConfig,
    monitor: Arc<LockPerformanceMonitor>,
    detector: Option<Arc<DeadlockDetector>>,
}

impl ReadWriteLockService {
    /// Create the service.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: LockConfig,
        monitor: Arc<LockPerformanceMonitor>,
        detector: Option<Arc<DeadlockDetector>>,
    ) -> Self {
        Self {
            store,
            config,
            monitor,
            detector,
        }
    }

    fn base_key(&self, lock_name: &str, key: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, lock_name, key)
    }

    fn read_key(&self, lock_name: &str, key: &str) -> String {
        format!("{}:read", self.base_key(lock_name, key))
    }

    fn write_key(&self, lock_name: &str, key: &str) -> String {
        format!("{}:write", self.base_key(lock_name, key))
    }

    fn reader_field(&self, owner: &str) -> String {
        format!("{}:{}", self.config.node_id, owner)
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

    /// Try to acquire a shared lock without blocking. Succeeds for any number
    /// of readers while no writer holds `{key}:write`.
    pub async fn try_read_lock(&self, owner: &str, lock_name: &str, key: &str, ttl: Duration) -> Result<Option<String>> {
        self.validate_call(owner, lock_name, key)?;
        self.monitor.record_attempt(lock_name);
        let token = LockToken::generate(&self.config.node_id, owner).to_string();
        let command = AtomicCommand::AcquireRead {
            read_key: self.read_key(lock_name, key),
            write_key: self.write_key(lock_name, key),
            field: self.reader_field(owner),
            value: token.clone(),
            ttl,
        };
        match self.store.execute(command).await {
            Ok(reply) if reply.acquired() => {
                self.monitor.record_success(lock_name, Duration::ZERO);
                debug!(lock_name, key, owner, "read lock acquired");
                Ok(Some(token))
            }
            Ok(_) => {
                self.monitor.record_failure(lock_name);
                Ok(None)
            }
            Err(err) => {
                warn!(lock_name, key, error = %err, "store error during read acquisition");
                self.monitor.record_failure(lock_name);
                Ok(None)
            }
        }
    }

    /// Try to acquire the exclusive lock without blocking. Succeeds only when
    /// neither readers nor a writer are present.
    pub async fn try_write_lock(&self, owner: &str, lock_name: &str, key: &str, ttl: Duration) -> Result<Option<String>> {
        self.validate_call(owner, lock_name, key)?;
        self.monitor.record_attempt(lock_name);
        let token = LockToken::generate(&self.config.node_id, owner).to_string();
        let write_key = self.write_key(lock_name, key);
        let command = AtomicCommand::AcquireWrite {
            read_key: self.read_key(lock_name, key),
            write_key: write_key.clone(),
            value: token.clone(),
            ttl,
        };
        match self.store.execute(command).await {
            Ok(reply) if reply.acquired() => {
                self.monitor.record_success(lock_name, Duration::ZERO);
                if let Some(detector) = &self.detector {
                    detector.record_lock_acquired(owner, &write_key);
                }
                debug!(lock_name, key, owner, "write lock acquired");
                Ok(Some(token))
            }
            Ok(_) => {
                self.monitor.record_failure(lock_name);
                Ok(None)
            }
            Err(err) => {
                warn!(lock_name, key, error = %err, "store error during write acquisition");
                self.monitor.record_failure(lock_name);
                Ok(None)
            }
        }
    }

    /// Acquire a shared lock, polling until `wait_timeout` elapses.
    pub async fn read_lock(
        &self,
        owner: &str,
        lock_name: &str,
        key: &str,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> Result<Option<String>> {
        self.wait_for(wait_timeout, || self.try_read_lock(owner, lock_name, key, ttl)).await
    }

    /// Acquire the exclusive lock, polling until `wait_timeout` elapses.
    pub async fn write_lock(
        &self,
        owner: &str,
        lock_name: &str,
        key: &str,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> Result<Option<String>> {
        let write_key = self.write_key(lock_name, key);
        if let Some(detector) = &self.detector {
            detector.record_wait_start(owner, &write_key);
        }
        let result = self.wait_for(wait_timeout, || self.try_write_lock(owner, lock_name, key, ttl)).await;
        if let Some(detector) = &self.detector {
            detector.record_wait_end(owner, &write_key);
        }
        result
    }

    /// Release a shared lock. Returns `false` when this owner's reader entry
    /// no longer matches `token`.
    pub async fn release_read_lock(&self, owner: &str, lock_name: &str, key: &str, token: &str) -> Result<bool> {
        self.validate_call(owner, lock_name, key)?;
        let command = AtomicCommand::ReleaseRead {
            read_key: self.read_key(lock_name, key),
            field: self.reader_field(owner),
            expected: token.to_string(),
        };
        match self.store.execute(command).await {
            Ok(reply) if reply.deleted() => {
                self.monitor.record_release(lock_name, Duration::ZERO);
                debug!(lock_name, key, owner, "read lock released");
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(err) => {
                warn!(lock_name, key, error = %err, "store error during read release");
                Ok(false)
            }
        }
    }

    /// Release the exclusive lock. Returns `false` when `token` no longer
    /// owns it.
    pub async fn release_write_lock(&self, owner: &str, lock_name: &str, key: &str, token: &str) -> Result<bool> {
        self.validate_call(owner, lock_name, key)?;
        let write_key = self.write_key(lock_name, key);
        let command = AtomicCommand::DeleteIfEquals {
            key: write_key.clone(),
            expected: token.to_string(),
        };
        match self.store.execute(command).await {
            Ok(reply) if reply.deleted() => {
                self.monitor.record_release(lock_name, Duration::ZERO);
                if let Some(detector) = &self.detector {
                    detector.record_lock_released(owner, &write_key);
                }
                debug!(lock_name, key, owner, "write lock released");
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(err) => {
                warn!(lock_name, key, error = %err, "store error during write release");
                Ok(false)
            }
        }
    }

    async fn wait_for<F, Fut>(&self, wait_timeout: Duration, mut attempt: F) -> Result<Option<String>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<String>>>,
    {
        let deadline = Instant::now() + wait_timeout;
        loop {
            if let Some(token) = attempt().await? {
                return Ok(Some(token));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = self.config.retry_interval.min(MAX_WAIT_SLICE).min(deadline - now);
            tokio::time::sleep(slice).await;
        }
    }
}
