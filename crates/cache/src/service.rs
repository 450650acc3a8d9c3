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

//! Invalidation broadcast.
//!
//! Writers publish [`InvalidationEvent`]s on one well-known channel;
//! every subscribed node (the publisher included) evicts matching local
//! entries through its registered listeners. Delivery is at-most-once and
//! fire-and-forget; a listener failure is isolated to that listener.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use lockstep_store::KeyValueStore;

use crate::error::{CacheError, Result};
use crate::tracker::CacheInvalidationTracker;

/// Default broadcast channel.
pub const DEFAULT_CHANNEL: &str = "cache:invalidation";

/// Wire format of one invalidation broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Cache namespace, e.g. `userSession`
    pub cache_type: String,
    /// Entry key within the namespace
    pub cache_key: String,
    /// Publisher clock at publish time, unix milliseconds
    pub timestamp: u64,
}

/// Callback invoked for every received invalidation event.
///
/// Invocation order across listeners is unspecified. An error return is
/// logged and does not affect other listeners.
#[async_trait]
pub trait InvalidationListener: Send + Sync + std::fmt::Debug {
    /// React to the invalidation of `{cache_type}:{cache_key}`.
    async fn on_invalidated(&self, cache_type: &str, cache_key: &str) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Per-node local cache the eviction listener operates on.
#[async_trait]
pub trait LocalCache: Send + Sync + std::fmt::Debug {
    /// Store a value.
    async fn put(&self, namespace: &str, key: &str, value: String);
    /// Fetch a value.
    async fn get(&self, namespace: &str, key: &str) -> Option<String>;
    /// Drop a value.
    async fn remove(&self, namespace: &str, key: &str);
}

/// Listener that evicts the event's entry from a [`LocalCache`].
#[derive(Debug)]
pub struct EvictingListener {
    cache: Arc<dyn LocalCache>,
}

impl EvictingListener {
    /// Create a listener over the given cache.
    pub fn new(cache: Arc<dyn LocalCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl InvalidationListener for EvictingListener {
    async fn on_invalidated(&self, cache_type: &str, cache_key: &str) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.cache.remove(cache_type, cache_key).await;
        Ok(())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Publishes and dispatches invalidation events.
#[derive(Debug)]
pub struct CacheInvalidationService {
    store: Arc<dyn KeyValueStore>,
    channel: String,
    listeners: DashMap<u64, Arc<dyn InvalidationListener>>,
    next_listener_id: AtomicU64,
    tracker: Option<Arc<CacheInvalidationTracker>>,
    shutdown: Arc<AtomicBool>,
}

impl CacheInvalidationService {
    /// Create a service on the default channel.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_channel(store, DEFAULT_CHANNEL)
    }

    /// Create a service on a custom channel.
    pub fn with_channel(store: Arc<dyn KeyValueStore>, channel: impl Into<String>) -> Self {
        Self {
            store,
            channel: channel.into(),
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
            tracker: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach a tracker that records every received event for stale-write
    /// rejection.
    pub fn with_tracker(mut self, tracker: Arc<CacheInvalidationTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Channel this service broadcasts on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Subscribe to the channel and spawn the dispatch loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut receiver = self.store.subscribe(&self.channel).await?;
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if service.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                service.dispatch(&message.payload).await;
            }
            debug!("invalidation dispatch loop ended");
        });
        Ok(())
    }

    /// Stop the dispatch loop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Broadcast an invalidation for `{cache_type}:{cache_key}`.
    ///
    /// Fire-and-forget: a publish failure is logged and not retried. The
    /// publisher's own listeners run when its subscription delivers the
    /// event back, like on every other node.
    pub async fn publish_invalidation(&self, cache_type: &str, cache_key: &str) -> Result<()> {
        if cache_type.is_empty() || cache_key.is_empty() {
            return Err(CacheError::invalid_argument("cache type and key must not be empty"));
        }
        let event = InvalidationEvent {
            cache_type: cache_type.to_string(),
            cache_key: cache_key.to_string(),
            timestamp: unix_millis(),
        };
        let payload = serde_json::to_string(&event)?;
        match self.store.publish(&self.channel, &payload).await {
            Ok(subscribers) => {
                debug!(cache_type, cache_key, subscribers, "invalidation published");
            }
            Err(err) => {
                warn!(cache_type, cache_key, error = %err, "invalidation publish failed, not retrying");
            }
        }
        Ok(())
    }

    /// Register a listener; returns an id for unregistering.
    pub fn register_listener(&self, listener: Arc<dyn InvalidationListener>) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, listener);
        id
    }

    /// Remove a listener by id.
    pub fn unregister_listener(&self, id: u64) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    async fn dispatch(&self, payload: &str) {
        let event: InvalidationEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "malformed invalidation event, skipping");
                return;
            }
        };

        if let Some(tracker) = &self.tracker {
            tracker.record_invalidation_at(&event.cache_type, &event.cache_key, event.timestamp);
        }

        let listeners: Vec<Arc<dyn InvalidationListener>> =
            self.listeners.iter().map(|entry| entry.value().clone()).collect();
        for listener in listeners {
            if let Err(err) = listener.on_invalidated(&event.cache_type, &event.cache_key).await {
                warn!(
                    cache_type = %event.cache_type,
                    cache_key = %event.cache_key,
                    error = %err,
                    "invalidation listener failed"
                );
            }
        }
    }
}
