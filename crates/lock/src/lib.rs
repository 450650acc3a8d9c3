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

//! Distributed lock services over a shared key-value store.
//!
//! Three lock flavors share one token format and one store:
//!
//! - [`ReentrantLockService`] — mutual exclusion with per-owner nesting, a
//!   waiter registry for early wake-up, and a renewal watchdog that extends
//!   live leases.
//! - [`ReadWriteLockService`] — shared/exclusive semantics over a reader
//!   hash and an exclusive write key.
//! - [`FairLockService`] — approximately-FIFO granting through a store-side
//!   waiter queue.
//!
//! [`LockManager`] fronts all three and wires in the [`DeadlockDetector`],
//! whose periodic scans break wait-for cycles by force-releasing the member
//! holding the fewest locks. [`DistributedDeadlockDetector`] extends the
//! same detection across nodes through graph state synced into the store.
//!
//! Contention never surfaces as an error: acquisition returns `Ok(None)` and
//! release returns `Ok(false)` when the caller lost the race, and callers
//! treat those as "try again or give up".

// ============================================================================
// Core Module Declarations
// ============================================================================

// Lock Services
pub mod fair;
pub mod reentrant;
pub mod rwlock;

// Deadlock Detection
pub mod deadlock;
pub mod distributed;

// Facade and Observability
pub mod manager;
pub mod monitor;

// Core Modules
pub mod config;
pub mod error;
pub mod types;

// ============================================================================
// Public API Exports
// ============================================================================

pub use crate::{
    config::{DetectorConfig, LockConfig},
    deadlock::{DeadlockDetector, ForceReleaser},
    distributed::{DistributedDeadlockDetector, VictimNotice},
    error::{LockError, Result},
    fair::FairLockService,
    manager::LockManager,
    monitor::{LockMetrics, LockPerformanceMonitor},
    reentrant::ReentrantLockService,
    rwlock::ReadWriteLockService,
    types::{DeadlockStatus, GlobalDeadlockStatus, HeldLock, LockKind, LockToken, ReentrantEntry},
};

/// Current version of the lock crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
