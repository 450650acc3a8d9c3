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

//! In-memory reference backend.
//!
//! Single-process implementation of [`KeyValueStore`] with real TTL
//! semantics. Every table lives behind one `RwLock`, so each
//! [`AtomicCommand`] is atomic by construction; a background sweeper reclaims
//! expired entries so TTL behavior matches a networked backend rather than
//! only expiring lazily on access.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc};

use crate::command::{AtomicCommand, CommandReply};
use crate::error::Result;
use crate::{KeyValueStore, Message};

/// Channel capacity per subscriber; a subscriber that falls this far behind
/// starts losing messages (at-most-once delivery).
const SUBSCRIBER_BUFFER: usize = 128;

#[derive(Debug, Clone)]
struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct HashEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct QueueEntry {
    tickets: VecDeque<String>,
    expires_at: Option<Instant>,
}

fn live(expires_at: Option<Instant>) -> bool {
    expires_at.is_none_or(|exp| Instant::now() < exp)
}

fn expiry(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() { None } else { Some(Instant::now() + ttl) }
}

#[derive(Debug, Default)]
struct Tables {
    strings: HashMap<String, ValueEntry>,
    hashes: HashMap<String, HashEntry>,
    queues: HashMap<String, QueueEntry>,
}

impl Tables {
    /// Drop the string at `key` if it has expired, then return whether a
    /// live value remains.
    fn string_live(&mut self, key: &str) -> bool {
        if let Some(entry) = self.strings.get(key) {
            if live(entry.expires_at) {
                return true;
            }
            self.strings.remove(key);
        }
        false
    }

    fn hash_live(&mut self, key: &str) -> bool {
        if let Some(entry) = self.hashes.get(key) {
            if live(entry.expires_at) && !entry.fields.is_empty() {
                return true;
            }
            self.hashes.remove(key);
        }
        false
    }

    fn queue_live(&mut self, key: &str) -> bool {
        if let Some(entry) = self.queues.get(key) {
            if live(entry.expires_at) && !entry.tickets.is_empty() {
                return true;
            }
            self.queues.remove(key);
        }
        false
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        self.strings.retain(|_, e| e.expires_at.is_none_or(|exp| now < exp));
        self.hashes
            .retain(|_, e| e.expires_at.is_none_or(|exp| now < exp) && !e.fields.is_empty());
        self.queues
            .retain(|_, e| e.expires_at.is_none_or(|exp| now < exp) && !e.tickets.is_empty());
    }
}

#[derive(Debug)]
struct Subscription {
    channel: String,
    sender: mpsc::Sender<Message>,
}

/// In-memory key-value store.
///
/// Cloning is cheap and clones share the same tables, so one instance can be
/// handed to several services to simulate a shared backend.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    shutdown: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new store and start its expiry sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let store = Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        store.spawn_sweeper();
        store
    }

    /// Stop the background sweeper.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn spawn_sweeper(&self) {
        let tables = self.tables.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    tracing::debug!("memory store sweeper shutting down");
                    break;
                }
                tables.write().await.sweep();
            }
        });
    }

    fn apply(tables: &mut Tables, command: AtomicCommand) -> CommandReply {
        match command {
            AtomicCommand::SetIfAbsent { key, value, ttl } => {
                if tables.string_live(&key) {
                    CommandReply::Acquired(false)
                } else {
                    tables.strings.insert(
                        key,
                        ValueEntry {
                            value,
                            expires_at: expiry(ttl),
                        },
                    );
                    CommandReply::Acquired(true)
                }
            }
            AtomicCommand::DeleteIfEquals { key, expected } => {
                let matches = tables.string_live(&key)
                    && tables.strings.get(&key).map(|e| e.value.as_str()) == Some(expected.as_str());
                if matches {
                    tables.strings.remove(&key);
                }
                CommandReply::Deleted(matches)
            }
            AtomicCommand::ExtendIfPrefix { key, prefix, ttl } => {
                if !tables.string_live(&key) {
                    return CommandReply::Extended(false);
                }
                let Some(entry) = tables.strings.get_mut(&key) else {
                    return CommandReply::Extended(false);
                };
                if entry.value.starts_with(&format!("{prefix}:")) {
                    entry.expires_at = expiry(ttl);
                    CommandReply::Extended(true)
                } else {
                    CommandReply::Extended(false)
                }
            }
            AtomicCommand::AcquireRead {
                read_key,
                write_key,
                field,
                value,
                ttl,
            } => {
                if tables.string_live(&write_key) {
                    return CommandReply::Acquired(false);
                }
                let entry = tables.hashes.entry(read_key).or_default();
                entry.fields.insert(field, value);
                entry.expires_at = expiry(ttl);
                CommandReply::Acquired(true)
            }
            AtomicCommand::AcquireWrite {
                read_key,
                write_key,
                value,
                ttl,
            } => {
                if tables.string_live(&write_key) || tables.hash_live(&read_key) {
                    return CommandReply::Acquired(false);
                }
                tables.strings.insert(
                    write_key,
                    ValueEntry {
                        value,
                        expires_at: expiry(ttl),
                    },
                );
                CommandReply::Acquired(true)
            }
            AtomicCommand::ReleaseRead {
                read_key,
                field,
                expected,
            } => {
                if !tables.hash_live(&read_key) {
                    return CommandReply::Deleted(false);
                }
                let Some(entry) = tables.hashes.get_mut(&read_key) else {
                    return CommandReply::Deleted(false);
                };
                let removed = if entry.fields.get(&field) == Some(&expected) {
                    entry.fields.remove(&field);
                    true
                } else {
                    false
                };
                if entry.fields.is_empty() {
                    tables.hashes.remove(&read_key);
                }
                CommandReply::Deleted(removed)
            }
            AtomicCommand::EnqueueWaiter { queue_key, ticket, ttl } => {
                tables.queue_live(&queue_key);
                let entry = tables.queues.entry(queue_key).or_default();
                let position = match entry.tickets.iter().position(|t| t == &ticket) {
                    Some(p) => p,
                    None => {
                        entry.tickets.push_back(ticket);
                        entry.tickets.len() - 1
                    }
                };
                entry.expires_at = expiry(ttl);
                CommandReply::Position(position)
            }
            AtomicCommand::AcquireIfFront {
                queue_key,
                ticket,
                lock_key,
                value,
                ttl,
            } => {
                if !tables.queue_live(&queue_key) {
                    return CommandReply::Acquired(false);
                }
                let at_front = tables
                    .queues
                    .get(&queue_key)
                    .and_then(|q| q.tickets.front())
                    .is_some_and(|front| front == &ticket);
                if !at_front || tables.string_live(&lock_key) {
                    return CommandReply::Acquired(false);
                }
                tables.strings.insert(
                    lock_key,
                    ValueEntry {
                        value,
                        expires_at: expiry(ttl),
                    },
                );
                let Some(queue) = tables.queues.get_mut(&queue_key) else {
                    return CommandReply::Acquired(true);
                };
                queue.tickets.pop_front();
                if queue.tickets.is_empty() {
                    tables.queues.remove(&queue_key);
                }
                CommandReply::Acquired(true)
            }
            AtomicCommand::RemoveWaiter { queue_key, ticket } => {
                if !tables.queue_live(&queue_key) {
                    return CommandReply::Deleted(false);
                }
                let Some(queue) = tables.queues.get_mut(&queue_key) else {
                    return CommandReply::Deleted(false);
                };
                let before = queue.tickets.len();
                queue.tickets.retain(|t| t != &ticket);
                let removed = queue.tickets.len() != before;
                if queue.tickets.is_empty() {
                    tables.queues.remove(&queue_key);
                }
                CommandReply::Deleted(removed)
            }
        }
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut tables = self.tables.write().await;
        if tables.string_live(key) {
            Ok(tables.strings.get(key).map(|e| e.value.clone()))
        } else {
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.strings.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let existed = tables.string_live(key) | tables.hash_live(key) | tables.queue_live(key);
        tables.strings.remove(key);
        tables.hashes.remove(key);
        tables.queues.remove(key);
        Ok(existed)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.hash_live(key);
        let entry = tables.hashes.entry(key.to_string()).or_default();
        entry.fields.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut tables = self.tables.write().await;
        if tables.hash_live(key) {
            Ok(tables.hashes.get(key).and_then(|e| e.fields.get(field).cloned()))
        } else {
            Ok(None)
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut tables = self.tables.write().await;
        if tables.hash_live(key) {
            Ok(tables.hashes.get(key).map(|e| e.fields.clone()).unwrap_or_default())
        } else {
            Ok(HashMap::new())
        }
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if !tables.hash_live(key) {
            return Ok(false);
        }
        let Some(entry) = tables.hashes.get_mut(key) else {
            return Ok(false);
        };
        let removed = entry.fields.remove(field).is_some();
        if entry.fields.is_empty() {
            tables.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn hash_delete_matching(&self, key: &str, field_prefix: &str) -> Result<usize> {
        let mut tables = self.tables.write().await;
        if !tables.hash_live(key) {
            return Ok(0);
        }
        let Some(entry) = tables.hashes.get_mut(key) else {
            return Ok(0);
        };
        let before = entry.fields.len();
        entry.fields.retain(|f, _| !f.starts_with(field_prefix));
        let removed = before - entry.fields.len();
        if entry.fields.is_empty() {
            tables.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn execute(&self, command: AtomicCommand) -> Result<CommandReply> {
        let mut tables = self.tables.write().await;
        Ok(Self::apply(&mut tables, command))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.retain(|s| !s.sender.is_closed());
        let mut delivered = 0;
        for subscription in subscriptions.iter().filter(|s| s.channel == channel) {
            let message = Message {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            match subscription.sender.try_send(message) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::warn!(channel, "dropping message for lagging subscriber");
                }
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Message>> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.push(Subscription {
            channel: channel.to_string(),
            sender,
        });
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_millis(30)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_if_absent_is_exclusive() {
        let store = MemoryStore::new();
        let first = store
            .execute(AtomicCommand::SetIfAbsent {
                key: "lock".into(),
                value: "a".into(),
                ttl: Duration::from_secs(30),
            })
            .await
            .unwrap();
        assert!(first.acquired());

        let second = store
            .execute(AtomicCommand::SetIfAbsent {
                key: "lock".into(),
                value: "b".into(),
                ttl: Duration::from_secs(30),
            })
            .await
            .unwrap();
        assert!(!second.acquired());
        assert_eq!(store.get("lock").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_set_if_absent_after_expiry() {
        let store = MemoryStore::new();
        store
            .execute(AtomicCommand::SetIfAbsent {
                key: "lock".into(),
                value: "a".into(),
                ttl: Duration::from_millis(20),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let retry = store
            .execute(AtomicCommand::SetIfAbsent {
                key: "lock".into(),
                value: "b".into(),
                ttl: Duration::from_secs(30),
            })
            .await
            .unwrap();
        assert!(retry.acquired());
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let store = MemoryStore::new();
        store.set("lock", "token", Duration::ZERO).await.unwrap();

        let wrong = store
            .execute(AtomicCommand::DeleteIfEquals {
                key: "lock".into(),
                expected: "other".into(),
            })
            .await
            .unwrap();
        assert!(!wrong.deleted());
        assert!(store.get("lock").await.unwrap().is_some());

        let right = store
            .execute(AtomicCommand::DeleteIfEquals {
                key: "lock".into(),
                expected: "token".into(),
            })
            .await
            .unwrap();
        assert!(right.deleted());
        assert!(store.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_extend_if_prefix() {
        let store = MemoryStore::new();
        store
            .set("lock", "node-1:worker:abc", Duration::from_millis(80))
            .await
            .unwrap();

        let miss = store
            .execute(AtomicCommand::ExtendIfPrefix {
                key: "lock".into(),
                prefix: "node-2:worker".into(),
                ttl: Duration::from_secs(5),
            })
            .await
            .unwrap();
        assert!(!miss.extended());

        let hit = store
            .execute(AtomicCommand::ExtendIfPrefix {
                key: "lock".into(),
                prefix: "node-1:worker".into(),
                ttl: Duration::from_secs(5),
            })
            .await
            .unwrap();
        assert!(hit.extended());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("lock").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_read_write_exclusivity() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);

        // Two readers coexist.
        for owner in ["n:a", "n:b"] {
            let reply = store
                .execute(AtomicCommand::AcquireRead {
                    read_key: "res:read".into(),
                    write_key: "res:write".into(),
                    field: owner.into(),
                    value: format!("{owner}:tok"),
                    ttl,
                })
                .await
                .unwrap();
            assert!(reply.acquired());
        }

        // Writer blocked while readers hold.
        let writer = store
            .execute(AtomicCommand::AcquireWrite {
                read_key: "res:read".into(),
                write_key: "res:write".into(),
                value: "n:c:tok".into(),
                ttl,
            })
            .await
            .unwrap();
        assert!(!writer.acquired());

        // Release both readers; writer proceeds.
        for owner in ["n:a", "n:b"] {
            let reply = store
                .execute(AtomicCommand::ReleaseRead {
                    read_key: "res:read".into(),
                    field: owner.into(),
                    expected: format!("{owner}:tok"),
                })
                .await
                .unwrap();
            assert!(reply.deleted());
        }
        let writer = store
            .execute(AtomicCommand::AcquireWrite {
                read_key: "res:read".into(),
                write_key: "res:write".into(),
                value: "n:c:tok".into(),
                ttl,
            })
            .await
            .unwrap();
        assert!(writer.acquired());

        // And now readers are blocked by the writer.
        let reader = store
            .execute(AtomicCommand::AcquireRead {
                read_key: "res:read".into(),
                write_key: "res:write".into(),
                field: "n:a".into(),
                value: "n:a:tok".into(),
                ttl,
            })
            .await
            .unwrap();
        assert!(!reader.acquired());
    }

    #[tokio::test]
    async fn test_release_read_requires_matching_value() {
        let store = MemoryStore::new();
        store
            .execute(AtomicCommand::AcquireRead {
                read_key: "r".into(),
                write_key: "w".into(),
                field: "n:a".into(),
                value: "n:a:tok".into(),
                ttl: Duration::from_secs(30),
            })
            .await
            .unwrap();

        let stale = store
            .execute(AtomicCommand::ReleaseRead {
                read_key: "r".into(),
                field: "n:a".into(),
                expected: "n:a:other".into(),
            })
            .await
            .unwrap();
        assert!(!stale.deleted());

        let ok = store
            .execute(AtomicCommand::ReleaseRead {
                read_key: "r".into(),
                field: "n:a".into(),
                expected: "n:a:tok".into(),
            })
            .await
            .unwrap();
        assert!(ok.deleted());
    }

    #[tokio::test]
    async fn test_queue_ordering() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);

        let first = store
            .execute(AtomicCommand::EnqueueWaiter {
                queue_key: "q".into(),
                ticket: "t1".into(),
                ttl,
            })
            .await
            .unwrap();
        assert_eq!(first.position(), Some(0));

        let second = store
            .execute(AtomicCommand::EnqueueWaiter {
                queue_key: "q".into(),
                ticket: "t2".into(),
                ttl,
            })
            .await
            .unwrap();
        assert_eq!(second.position(), Some(1));

        // Re-enqueue is idempotent.
        let again = store
            .execute(AtomicCommand::EnqueueWaiter {
                queue_key: "q".into(),
                ticket: "t1".into(),
                ttl,
            })
            .await
            .unwrap();
        assert_eq!(again.position(), Some(0));

        // t2 is not at the front.
        let blocked = store
            .execute(AtomicCommand::AcquireIfFront {
                queue_key: "q".into(),
                ticket: "t2".into(),
                lock_key: "lock".into(),
                value: "v2".into(),
                ttl,
            })
            .await
            .unwrap();
        assert!(!blocked.acquired());

        // t1 is, and acquisition pops it.
        let granted = store
            .execute(AtomicCommand::AcquireIfFront {
                queue_key: "q".into(),
                ticket: "t1".into(),
                lock_key: "lock".into(),
                value: "v1".into(),
                ttl,
            })
            .await
            .unwrap();
        assert!(granted.acquired());
        assert_eq!(store.get("lock").await.unwrap(), Some("v1".to_string()));

        // t2 heads the queue now, but the lock is still held.
        let held = store
            .execute(AtomicCommand::AcquireIfFront {
                queue_key: "q".into(),
                ticket: "t2".into(),
                lock_key: "lock".into(),
                value: "v2".into(),
                ttl,
            })
            .await
            .unwrap();
        assert!(!held.acquired());

        // Abandoning the wait removes the ticket.
        let removed = store
            .execute(AtomicCommand::RemoveWaiter {
                queue_key: "q".into(),
                ticket: "t2".into(),
            })
            .await
            .unwrap();
        assert!(removed.deleted());
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = MemoryStore::new();
        store.hash_set("h", "f1", "v1").await.unwrap();
        store.hash_set("h", "f2", "v2").await.unwrap();
        store.hash_set("h", "g1", "v3").await.unwrap();

        assert_eq!(store.hash_get("h", "f1").await.unwrap(), Some("v1".to_string()));
        assert_eq!(store.hash_get_all("h").await.unwrap().len(), 3);

        assert!(store.hash_delete("h", "f1").await.unwrap());
        assert!(!store.hash_delete("h", "f1").await.unwrap());

        assert_eq!(store.hash_delete_matching("h", "f").await.unwrap(), 1);
        assert_eq!(store.hash_get_all("h").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("events").await.unwrap();

        let delivered = store.publish("events", "hello").await.unwrap();
        assert_eq!(delivered, 1);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.channel, "events");
        assert_eq!(message.payload, "hello");

        // Other channels are not delivered here.
        store.publish("other", "nope").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscriber() {
        let store = MemoryStore::new();
        store.publish("events", "early").await.unwrap();
        let mut rx = store.subscribe("events").await.unwrap();
        assert!(rx.try_recv().is_err());
        store.publish("events", "late").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, "late");
    }
}
