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

//! Key-value store abstraction backing the Lockstep coordination primitives.
//!
//! The lock services, deadlock detectors and cache invalidation broadcast all
//! talk to a shared store through the [`KeyValueStore`] trait: plain string
//! keys with TTL, hash keys, a closed vocabulary of atomic check-and-mutate
//! commands ([`AtomicCommand`]), and channel-based publish/subscribe.
//!
//! The trait is deliberately narrow. Anything that must be race-free against
//! concurrent nodes is expressed as an `AtomicCommand` variant the backend
//! applies as one indivisible step; plain `get`/`set`/hash calls are reserved
//! for state where a relaxed view is acceptable (graph snapshots, heartbeats).
//!
//! [`MemoryStore`] is the reference backend: single-process, TTL-accurate,
//! and atomic by construction. It backs the test suites and single-node
//! deployments; a networked backend (Redis and friends) implements the same
//! trait with server-side scripts.

// ============================================================================
// Core Module Declarations
// ============================================================================

pub mod command;
pub mod error;
pub mod memory;

// ============================================================================
// Public API Exports
// ============================================================================

pub use crate::{
    command::{AtomicCommand, CommandReply},
    error::{Result, StoreError},
    memory::MemoryStore,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// A message delivered to a channel subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message was published on
    pub channel: String,
    /// Raw payload as published
    pub payload: String,
}

/// Shared key-value store consumed by the coordination services.
///
/// All operations are synchronous from the caller's point of view and may
/// block on backend I/O. Delivery over [`publish`](KeyValueStore::publish) is
/// at-most-once: a slow subscriber loses messages rather than stalling the
/// publisher.
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Get the string value at `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set `key` to `value`. A `ttl` of zero means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete `key` (string, hash or queue). Returns whether anything existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Set `field` in the hash at `key`, creating the hash when needed.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Get a single hash field.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Get every field of the hash at `key`; empty map when absent.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Delete one hash field. Returns whether the field existed.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool>;

    /// Delete every hash field whose name starts with `field_prefix`.
    /// Returns the number of fields removed.
    async fn hash_delete_matching(&self, key: &str, field_prefix: &str) -> Result<usize>;

    /// Apply an atomic check-and-mutate command as a single indivisible step.
    async fn execute(&self, command: AtomicCommand) -> Result<CommandReply>;

    /// Publish `payload` on `channel`. Returns the number of subscribers the
    /// message was handed to; delivery is best-effort.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Subscribe to `channel`. Messages published after this call arrive on
    /// the returned receiver; there is no replay of earlier traffic.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Message>>;
}
