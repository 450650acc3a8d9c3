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

use std::time::Duration;

/// Atomic check-and-mutate operations executed inside the store.
///
/// Every lock-path mutation goes through one of these variants rather than a
/// read-then-write sequence; a backend must apply each variant as a single
/// indivisible step. A `ttl` of zero means the affected key never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicCommand {
    /// Set `key` to `value` with `ttl` only if `key` is currently absent.
    SetIfAbsent { key: String, value: String, ttl: Duration },

    /// Delete `key` only if its current value equals `expected`.
    DeleteIfEquals { key: String, expected: String },

    /// Push `key`'s expiry out to `ttl` from now, only if its current value
    /// starts with `prefix` followed by a colon.
    ExtendIfPrefix { key: String, prefix: String, ttl: Duration },

    /// Write `field = value` into the hash at `read_key` and refresh the hash
    /// TTL, only if `write_key` is absent.
    AcquireRead {
        read_key: String,
        write_key: String,
        field: String,
        value: String,
        ttl: Duration,
    },

    /// Set `write_key` to `value` with `ttl`, only if both `write_key` and
    /// the hash at `read_key` are absent.
    AcquireWrite {
        read_key: String,
        write_key: String,
        value: String,
        ttl: Duration,
    },

    /// Remove `field` from the hash at `read_key` only if it holds
    /// `expected`; drops the hash entirely once its last field is gone.
    ReleaseRead {
        read_key: String,
        field: String,
        expected: String,
    },

    /// Append `ticket` to the queue at `queue_key` unless already present,
    /// refreshing the queue TTL. Replies with the ticket's queue position.
    EnqueueWaiter {
        queue_key: String,
        ticket: String,
        ttl: Duration,
    },

    /// Grant the lock at `lock_key` to `value` only if `ticket` heads the
    /// queue at `queue_key` and `lock_key` is absent; pops the ticket on
    /// success.
    AcquireIfFront {
        queue_key: String,
        ticket: String,
        lock_key: String,
        value: String,
        ttl: Duration,
    },

    /// Remove `ticket` from the queue at `queue_key` wherever it sits.
    RemoveWaiter { queue_key: String, ticket: String },
}

/// Outcome of an [`AtomicCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandReply {
    /// The acquire-style command took effect
    Acquired(bool),
    /// The delete-style command removed something
    Deleted(bool),
    /// The expiry was extended
    Extended(bool),
    /// Position in the waiter queue, zero-based
    Position(usize),
}

impl CommandReply {
    /// True when an acquire-style command succeeded
    pub fn acquired(&self) -> bool {
        matches!(self, Self::Acquired(true))
    }

    /// True when a delete-style command removed its target
    pub fn deleted(&self) -> bool {
        matches!(self, Self::Deleted(true))
    }

    /// True when an extend command pushed the expiry out
    pub fn extended(&self) -> bool {
        matches!(self, Self::Extended(true))
    }

    /// Queue position, when the reply carries one
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::Position(p) => Some(*p),
            _ => None,
        }
    }
}
