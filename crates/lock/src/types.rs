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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Lock kind enumeration.
///
/// The manager dispatches on this closed set; a token acquired under one
/// kind must be released through the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    /// Reentrant exclusive lock
    Reentrant,
    /// Shared (read) side of a read-write lock
    Read,
    /// Exclusive (write) side of a read-write lock
    Write,
    /// Approximately-FIFO exclusive lock
    Fair,
}

/// Unique holder token stored as the lock's value.
///
/// Rendered as `node:owner:uuid`. The first two parts form the renewal
/// prefix: only the same node/owner pairing can extend the lease, so a holder
/// that reacquired after a crash never renews a predecessor's entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken {
    /// Node that acquired the lock
    pub node_id: String,
    /// Caller-supplied task/thread identity on that node
    pub owner_id: String,
    /// Uniqueness suffix
    pub uuid: String,
}

impl LockToken {
    /// Generate a fresh token for a node/owner pairing.
    pub fn generate(node_id: &str, owner_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            owner_id: owner_id.to_string(),
            uuid: Uuid::new_v4().to_string(),
        }
    }

    /// Parse a stored lock value.
    ///
    /// Requires exactly three non-empty colon-separated parts; anything else
    /// is malformed and yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ':');
        let node_id = parts.next()?;
        let owner_id = parts.next()?;
        let uuid = parts.next()?;
        if node_id.is_empty() || owner_id.is_empty() || uuid.is_empty() || uuid.contains(':') {
            return None;
        }
        Some(Self {
            node_id: node_id.to_string(),
            owner_id: owner_id.to_string(),
            uuid: uuid.to_string(),
        })
    }

    /// The `node:owner` prefix used by renewal.
    pub fn renew_prefix(&self) -> String {
        format!("{}:{}", self.node_id, self.owner_id)
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.node_id, self.owner_id, self.uuid)
    }
}

/// Per-owner reentrancy bookkeeping.
///
/// Present only between an owner's first acquisition and its final release;
/// `count` never drops below 1 while the entry exists.
#[derive(Debug, Clone)]
pub struct ReentrantEntry {
    /// Full store key of the held lock
    pub lock_key: String,
    /// Token returned to the caller on first acquisition
    pub token: String,
    /// Nesting depth
    pub count: u32,
}

/// Node-global record of a store-side lock this node believes it holds.
///
/// Scanned by the renewal watchdog; removed on release or when renewal is
/// rejected.
#[derive(Debug, Clone)]
pub struct HeldLock {
    /// Logical lock name, used for statistics
    pub lock_name: String,
    /// Full store key
    pub lock_key: String,
    /// Holder token as stored
    pub token: String,
    /// Lease duration the lock was acquired with
    pub ttl: Duration,
    /// Acquisition instant
    pub acquired_at: Instant,
    /// Last successful renewal (or acquisition)
    pub last_renewed: Instant,
}

impl HeldLock {
    /// Whether the lease has passed its half-life and should be renewed.
    pub fn renewal_due(&self) -> bool {
        self.last_renewed.elapsed() >= self.ttl / 2
    }
}

/// Snapshot of the local wait-for graph, for operational inspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeadlockStatus {
    /// owner -> locks held
    pub owner_locks: HashMap<String, Vec<String>>,
    /// owner -> locks waited on
    pub owner_waits: HashMap<String, Vec<String>>,
    /// lock -> holding owner
    pub lock_holders: HashMap<String, String>,
    /// lock -> waiting owners
    pub lock_waiters: HashMap<String, Vec<String>>,
    /// owner -> milliseconds until its safety deadline fires
    pub owner_deadlines_ms: HashMap<String, u64>,
    /// Scans performed so far
    pub scans: u64,
    /// Cycles found so far
    pub cycles_found: u64,
    /// Locks force-released so far
    pub forced_releases: u64,
}

/// Snapshot of the assembled cross-node graph.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalDeadlockStatus {
    /// This node's identity
    pub node_id: String,
    /// Nodes with a live heartbeat
    pub active_nodes: Vec<String>,
    /// node -> last heartbeat, unix milliseconds
    pub node_heartbeats: HashMap<String, u64>,
    /// composite owner (`node:owner`) -> locks held
    pub owner_locks: HashMap<String, Vec<String>>,
    /// composite owner -> locks waited on
    pub owner_waits: HashMap<String, Vec<String>>,
    /// lock -> composite holding owner
    pub lock_holders: HashMap<String, String>,
    /// This node's local view
    pub local: DeadlockStatus,
}

/// Current unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
