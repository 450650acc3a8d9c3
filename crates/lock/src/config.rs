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
use std::time::Duration;
use uuid::Uuid;

/// Lock service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Identity of this node, embedded in every lock token.
    /// Must not contain ':'.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Prefix for all lock keys in the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Lease duration when the caller does not specify one
    #[serde(default = "default_ttl")]
    pub default_ttl: Duration,

    /// Wait budget for the scoped-acquisition helpers
    #[serde(default = "default_wait_timeout")]
    pub default_wait_timeout: Duration,

    /// Polling interval while waiting for a contended lock
    #[serde(default = "default_retry_interval")]
    pub retry_interval: Duration,

    /// Fixed delay between renewal watchdog passes
    #[serde(default = "default_renew_interval")]
    pub renew_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            key_prefix: default_key_prefix(),
            default_ttl: default_ttl(),
            default_wait_timeout: default_wait_timeout(),
            retry_interval: default_retry_interval(),
            renew_interval: default_renew_interval(),
        }
    }
}

/// Deadlock detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Fixed delay between local graph scans
    #[serde(default = "default_scan_interval")]
    pub scan_interval: Duration,

    /// Safety valve: an owner holding locks longer than this has them
    /// force-released regardless of cycles
    #[serde(default = "default_owner_deadline")]
    pub owner_deadline: Duration,

    /// Fixed delay between pushes of the local graph into the store
    #[serde(default = "default_sync_interval")]
    pub sync_interval: Duration,

    /// Fixed delay between cross-node detection passes
    #[serde(default = "default_global_interval")]
    pub global_detection_interval: Duration,

    /// Fixed delay between heartbeat writes
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// A node whose heartbeat is older than this is purged from the
    /// shared graph
    #[serde(default = "default_node_timeout")]
    pub node_timeout: Duration,

    /// Fixed delay between stale-node cleanup passes
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,

    /// Prefix for the shared graph keys
    #[serde(default = "default_graph_prefix")]
    pub key_prefix: String,

    /// Channel victim notifications are broadcast on
    #[serde(default = "default_victim_channel")]
    pub victim_channel: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scan_interval: default_scan_interval(),
            owner_deadline: default_owner_deadline(),
            sync_interval: default_sync_interval(),
            global_detection_interval: default_global_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            node_timeout: default_node_timeout(),
            cleanup_interval: default_cleanup_interval(),
            key_prefix: default_graph_prefix(),
            victim_channel: default_victim_channel(),
        }
    }
}

// Default value functions

fn default_node_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_key_prefix() -> String {
    "lock".to_string()
}

fn default_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_renew_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_owner_deadline() -> Duration {
    Duration::from_secs(30)
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_global_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_node_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_graph_prefix() -> String {
    "deadlock".to_string()
}

fn default_victim_channel() -> String {
    "deadlock:victims".to_string()
}

impl LockConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.node_id.is_empty() || self.node_id.contains(':') {
            return Err(crate::error::LockError::configuration(
                "node_id must be non-empty and must not contain ':'",
            ));
        }

        if self.key_prefix.is_empty() {
            return Err(crate::error::LockError::configuration("key_prefix must not be empty"));
        }

        if self.default_ttl.is_zero() {
            return Err(crate::error::LockError::configuration("default_ttl must be greater than zero"));
        }

        if self.retry_interval.is_zero() {
            return Err(crate::error::LockError::configuration(
                "retry_interval must be greater than zero",
            ));
        }

        if self.renew_interval.is_zero() {
            return Err(crate::error::LockError::configuration(
                "renew_interval must be greater than zero",
            ));
        }

        Ok(())
    }
}

impl DetectorConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        for (name, value) in [
            ("scan_interval", self.scan_interval),
            ("owner_deadline", self.owner_deadline),
            ("sync_interval", self.sync_interval),
            ("global_detection_interval", self.global_detection_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("node_timeout", self.node_timeout),
            ("cleanup_interval", self.cleanup_interval),
        ] {
            if value.is_zero() {
                return Err(crate::error::LockError::configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.node_timeout < self.heartbeat_interval {
            return Err(crate::error::LockError::configuration(
                "node_timeout must be at least the heartbeat_interval",
            ));
        }

        if self.key_prefix.is_empty() || self.victim_channel.is_empty() {
            return Err(crate::error::LockError::configuration(
                "key_prefix and victim_channel must not be empty",
            ));
        }

        Ok(())
    }
}
