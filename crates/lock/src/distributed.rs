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

//! Cross-node deadlock detection.
//!
//! Each node periodically serializes its local wait-for graph into shared
//! hashes keyed by `node:owner`, reassembles the union on a detection pass,
//! and runs the same depth-first cycle search as the local detector. The
//! victim node (fewest locks held among cycle participants) releases its own
//! locks directly when local, or is asked to over a broadcast channel when
//! remote. Heartbeats bound how long a crashed node's graph entries survive.
//!
//! Every periodic task catches and logs its own failures; one bad cycle
//! never stops the detector.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, warn};

use lockstep_store::KeyValueStore;

use crate::config::DetectorConfig;
use crate::deadlock::{DeadlockDetector, find_cycles};
use crate::error::Result;
use crate::types::{GlobalDeadlockStatus, unix_millis};

/// Broadcast asking a node to release a deadlock victim's locks.
///
/// Delivery is best-effort; force release is idempotent, so duplicates are
/// harmless and a lost notice is healed by the next detection pass or by
/// lease expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VictimNotice {
    /// Node expected to act
    pub node_id: String,
    /// Composite `node:owner` ids whose locks should be released
    pub owners: Vec<String>,
    /// Full cycle, for diagnostics
    pub cycle: Vec<String>,
}

/// Distributed deadlock detector layered over the local one.
#[derive(Debug)]
pub struct DistributedDeadlockDetector {
    local: Arc<DeadlockDetector>,
    store: Arc<dyn KeyValueStore>,
    config: DetectorConfig,
    node_id: String,
    shutdown: Arc<AtomicBool>,
}

impl DistributedDeadlockDetector {
    /// Create the detector. Call [`start`](Self::start) to spawn its
    /// periodic tasks.
    pub fn new(local: Arc<DeadlockDetector>, store: Arc<dyn KeyValueStore>, node_id: impl Into<String>) -> Self {
        let config = local.config().clone();
        Self {
            local,
            store,
            config,
            node_id: node_id.into(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// This node's identity
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The wrapped local detector
    pub fn local(&self) -> &Arc<DeadlockDetector> {
        &self.local
    }

    fn graph_key(&self) -> String {
        format!("{}:graph", self.config.key_prefix)
    }

    fn waits_key(&self) -> String {
        format!("{}:waits", self.config.key_prefix)
    }

    fn holders_key(&self) -> String {
        format!("{}:holders", self.config.key_prefix)
    }

    fn nodes_key(&self) -> String {
        format!("{}:nodes", self.config.key_prefix)
    }

    fn composite(&self, owner: &str) -> String {
        format!("{}:{}", self.node_id, owner)
    }

    /// Spawn the sync, global-detection and heartbeat/cleanup tasks plus the
    /// victim-notice listener.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.spawn_victim_listener().await?;

        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(detector.config.sync_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if detector.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(err) = detector.sync_local_state().await {
                    error!(error = %err, "graph sync failed, will retry next pass");
                }
            }
        });

        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(detector.config.global_detection_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if detector.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(err) = detector.run_global_detection().await {
                    error!(error = %err, "global deadlock detection failed, will retry next pass");
                }
            }
        });

        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(detector.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_cleanup = Instant::now();
            loop {
                ticker.tick().await;
                if detector.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(err) = detector.heartbeat().await {
                    error!(error = %err, "heartbeat write failed");
                }
                if last_cleanup.elapsed() >= detector.config.cleanup_interval {
                    last_cleanup = Instant::now();
                    if let Err(err) = detector.cleanup_stale_nodes().await {
                        error!(error = %err, "stale node cleanup failed");
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop the periodic tasks.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Serialize this node's graph into the shared store under composite
    /// `node:owner` fields.
    pub async fn sync_local_state(&self) -> Result<()> {
        let status = self.local.status();
        let own_prefix = format!("{}:", self.node_id);

        // Replace this node's previous contribution wholesale; owners that
        // released everything since the last sync must disappear.
        self.store.hash_delete_matching(&self.graph_key(), &own_prefix).await?;
        self.store.hash_delete_matching(&self.waits_key(), &own_prefix).await?;
        for (lock_key, holder) in self.store.hash_get_all(&self.holders_key()).await? {
            if holder.starts_with(&own_prefix) {
                self.store.hash_delete(&self.holders_key(), &lock_key).await?;
            }
        }

        for (owner, locks) in &status.owner_locks {
            let field = self.composite(owner);
            let payload = serde_json::to_string(locks)?;
            self.store.hash_set(&self.graph_key(), &field, &payload).await?;
        }
        for (owner, waits) in &status.owner_waits {
            let field = self.composite(owner);
            let payload = serde_json::to_string(waits)?;
            self.store.hash_set(&self.waits_key(), &field, &payload).await?;
        }
        for (lock_key, holder) in &status.lock_holders {
            self.store
                .hash_set(&self.holders_key(), lock_key, &self.composite(holder))
                .await?;
        }

        debug!(owners = status.owner_locks.len(), "local graph synced");
        Ok(())
    }

    /// Reassemble the union graph from every node's synced state and return
    /// the cycles found, as lists of composite `node:owner` ids.
    pub async fn detect_global_deadlocks(&self) -> Result<Vec<Vec<String>>> {
        let (_, owner_waits, lock_holders) = self.read_global_graph().await?;
        Ok(find_cycles(&owner_waits, &lock_holders))
    }

    /// One detection pass: find cycles, pick a victim node per cycle, act
    /// locally or notify the victim over broadcast.
    pub async fn run_global_detection(&self) -> Result<()> {
        let (owner_locks, owner_waits, lock_holders) = self.read_global_graph().await?;
        let cycles = find_cycles(&owner_waits, &lock_holders);

        for cycle in cycles {
            warn!(?cycle, "cross-node deadlock cycle detected");
            let Some(victim_node) = pick_victim_node(&cycle, &owner_locks) else {
                continue;
            };
            let victim_owners: Vec<String> = cycle
                .iter()
                .filter(|owner| node_of(owner) == victim_node)
                .cloned()
                .collect();

            if victim_node == self.node_id {
                for composite in &victim_owners {
                    let owner = local_part(composite);
                    warn!(owner, "this node is the deadlock victim, force-releasing");
                    self.local.force_release_owner(owner).await;
                }
            } else {
                let notice = VictimNotice {
                    node_id: victim_node.clone(),
                    owners: victim_owners,
                    cycle: cycle.clone(),
                };
                let payload = serde_json::to_string(&notice)?;
                match self.store.publish(&self.config.victim_channel, &payload).await {
                    Ok(_) => debug!(victim = %victim_node, "victim notice published"),
                    Err(err) => warn!(error = %err, "victim notice publish failed"),
                }
            }
        }

        Ok(())
    }

    /// Write this node's liveness timestamp.
    pub async fn heartbeat(&self) -> Result<()> {
        self.store
            .hash_set(&self.nodes_key(), &self.node_id, &unix_millis().to_string())
            .await?;
        Ok(())
    }

    /// Purge graph entries of nodes whose heartbeat exceeded the node
    /// timeout. Returns the nodes removed.
    pub async fn cleanup_stale_nodes(&self) -> Result<Vec<String>> {
        let heartbeats = self.store.hash_get_all(&self.nodes_key()).await?;
        let now = unix_millis();
        let timeout_ms = self.config.node_timeout.as_millis() as u64;

        let mut removed = Vec::new();
        for (node, stamp) in heartbeats {
            let alive = stamp
                .parse::<u64>()
                .map(|last| now.saturating_sub(last) <= timeout_ms)
                .unwrap_or(false);
            if alive || node == self.node_id {
                continue;
            }

            warn!(%node, "purging graph entries of stale node");
            let prefix = format!("{node}:");
            self.store.hash_delete_matching(&self.graph_key(), &prefix).await?;
            self.store.hash_delete_matching(&self.waits_key(), &prefix).await?;
            for (lock_key, holder) in self.store.hash_get_all(&self.holders_key()).await? {
                if holder.starts_with(&prefix) {
                    self.store.hash_delete(&self.holders_key(), &lock_key).await?;
                }
            }
            self.store.hash_delete(&self.nodes_key(), &node).await?;
            removed.push(node);
        }

        Ok(removed)
    }

    /// Snapshot of the assembled global graph for operational inspection.
    pub async fn status(&self) -> Result<GlobalDeadlockStatus> {
        let (owner_locks, owner_waits, lock_holders) = self.read_global_graph().await?;
        let heartbeats = self.store.hash_get_all(&self.nodes_key()).await?;
        let now = unix_millis();
        let timeout_ms = self.config.node_timeout.as_millis() as u64;

        let node_heartbeats: HashMap<String, u64> = heartbeats
            .into_iter()
            .filter_map(|(node, stamp)| stamp.parse::<u64>().ok().map(|millis| (node, millis)))
            .collect();
        let mut active_nodes: Vec<String> = node_heartbeats
            .iter()
            .filter(|(_, last)| now.saturating_sub(**last) <= timeout_ms)
            .map(|(node, _)| node.clone())
            .collect();
        active_nodes.sort();

        Ok(GlobalDeadlockStatus {
            node_id: self.node_id.clone(),
            active_nodes,
            node_heartbeats,
            owner_locks: owner_locks
                .into_iter()
                .map(|(owner, locks)| {
                    let mut locks: Vec<String> = locks.into_iter().collect();
                    locks.sort();
                    (owner, locks)
                })
                .collect(),
            owner_waits: owner_waits
                .into_iter()
                .map(|(owner, waits)| {
                    let mut waits: Vec<String> = waits.into_iter().collect();
                    waits.sort();
                    (owner, waits)
                })
                .collect(),
            lock_holders,
            local: self.local.status(),
        })
    }

    async fn spawn_victim_listener(self: &Arc<Self>) -> Result<()> {
        let mut receiver = self.store.subscribe(&self.config.victim_channel).await?;
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if detector.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let notice: VictimNotice = match serde_json::from_str(&message.payload) {
                    Ok(notice) => notice,
                    Err(err) => {
                        warn!(error = %err, "malformed victim notice, skipping");
                        continue;
                    }
                };
                if notice.node_id != detector.node_id {
                    continue;
                }
                warn!(?notice.cycle, "victim notice received, force-releasing named owners");
                for composite in &notice.owners {
                    detector.local.force_release_owner(local_part(composite)).await;
                }
            }
            debug!("victim listener ended");
        });
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    async fn read_global_graph(
        &self,
    ) -> Result<(
        HashMap<String, HashSet<String>>,
        HashMap<String, HashSet<String>>,
        HashMap<String, String>,
    )> {
        let (graph, waits, lock_holders) = futures::future::try_join3(
            self.store.hash_get_all(&self.graph_key()),
            self.store.hash_get_all(&self.waits_key()),
            self.store.hash_get_all(&self.holders_key()),
        )
        .await?;
        Ok((parse_lock_sets(graph), parse_lock_sets(waits), lock_holders))
    }
}

fn parse_lock_sets(fields: HashMap<String, String>) -> HashMap<String, HashSet<String>> {
    let mut parsed = HashMap::new();
    for (owner, payload) in fields {
        match serde_json::from_str::<Vec<String>>(&payload) {
            Ok(locks) => {
                parsed.insert(owner, locks.into_iter().collect());
            }
            Err(err) => {
                warn!(%owner, error = %err, "malformed graph segment, skipping");
            }
        }
    }
    parsed
}

fn node_of(composite: &str) -> &str {
    composite.split(':').next().unwrap_or(composite)
}

fn local_part(composite: &str) -> &str {
    composite.splitn(2, ':').nth(1).unwrap_or(composite)
}

/// Pick the node whose cycle participants hold the fewest locks in total;
/// first-found (cycle order) wins ties.
fn pick_victim_node(cycle: &[String], owner_locks: &HashMap<String, HashSet<String>>) -> Option<String> {
    let mut totals: Vec<(String, usize)> = Vec::new();
    for owner in cycle {
        let node = node_of(owner).to_string();
        let held = owner_locks.get(owner).map(|locks| locks.len()).unwrap_or(0);
        match totals.iter_mut().find(|(existing, _)| *existing == node) {
            Some((_, total)) => *total += held,
            None => totals.push((node, held)),
        }
    }

    let mut victim: Option<(String, usize)> = None;
    for (node, total) in totals {
        match &victim {
            Some((_, best)) if total >= *best => {}
            _ => victim = Some((node, total)),
        }
    }
    victim.map(|(node, _)| node)
}
