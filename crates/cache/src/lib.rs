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

//! Cache invalidation broadcast for multi-node deployments.
//!
//! When any node writes through a cached entry it publishes an
//! [`InvalidationEvent`] over the shared store's pub/sub channel;
//! [`CacheInvalidationService`] on every node (publisher included) fans the
//! event out to registered [`InvalidationListener`]s, typically an
//! [`EvictingListener`] over the node's [`LocalCache`]. Delivery is
//! at-most-once; correctness against lost events comes from TTLs on the
//! cached data itself.
//!
//! [`CacheInvalidationTracker`] closes the remaining race: a writer holding
//! data fetched *before* the latest invalidation consults
//! [`is_invalidated`](CacheInvalidationTracker::is_invalidated) and discards
//! its stale write instead of resurrecting dead data.

// ============================================================================
// Core Module Declarations
// ============================================================================

pub mod error;
pub mod service;
pub mod tracker;

// ============================================================================
// Public API Exports
// ============================================================================

pub use crate::{
    error::{CacheError, Result},
    service::{
        CacheInvalidationService, DEFAULT_CHANNEL, EvictingListener, InvalidationEvent, InvalidationListener, LocalCache,
    },
    tracker::CacheInvalidationTracker,
};

/// Current version of the cache crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
