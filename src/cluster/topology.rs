// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Partition topology: who owns what, at which topology version.
//!
//! [`InMemoryTopology`] is the single-process implementation. Every node's
//! view shares one [`ClusterState`] (membership, version, assignment) and
//! keeps its own near-reader tracking and rebalancing state.

use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::NodeId;
use crate::entry::{CacheKey, PartitionId};
use crate::version::{TopologyVersion, Version};

/// Partition ownership as seen by one node.
pub trait PartitionTopology: Send + Sync {
    /// Block topology changes while the guard is held. Derefs to the
    /// version in force.
    fn read_lock(&self) -> RwLockReadGuard<'_, TopologyVersion>;

    fn current_version(&self) -> TopologyVersion;

    fn local_node(&self) -> NodeId;

    fn partition(&self, key: &str) -> PartitionId;

    /// Owners of `partition`, primary first.
    fn nodes_owning(&self, partition: PartitionId, version: TopologyVersion) -> Vec<NodeId>;

    fn is_primary(&self, node: NodeId, partition: PartitionId, version: TopologyVersion) -> bool {
        self.nodes_owning(partition, version).first() == Some(&node)
    }

    /// Nodes holding `key` in their near cache.
    fn readers_of(&self, key: &str) -> Vec<NodeId>;

    fn remove_reader(&self, key: &str, node: NodeId);

    fn node_alive(&self, node: NodeId) -> bool;

    /// Partitions `node` is primary for.
    fn primary_partitions(&self, node: NodeId, version: TopologyVersion) -> Vec<PartitionId>;

    /// Lock `partition` against rebalancing if it is currently moving.
    /// `None` when the partition is stable and no lock is needed.
    fn lock_if_moving(&self, partition: PartitionId) -> Option<MutexGuard<'_, ()>>;

    /// A key was evicted from a moving partition; the preloader must not
    /// bring it back.
    fn on_entry_evicted(&self, partition: PartitionId, key: &str, version: Version);
}

struct Assignment {
    nodes: Vec<NodeId>,
    owners: Vec<Vec<NodeId>>,
}

/// Membership and partition assignment shared by all in-process nodes.
pub struct ClusterState {
    version: RwLock<TopologyVersion>,
    assignment: RwLock<Assignment>,
    partitions: u32,
    backups: usize,
    hasher: RandomState,
}

impl ClusterState {
    pub fn new(partitions: u32, backups: usize) -> Arc<Self> {
        Arc::new(Self {
            version: RwLock::new(0),
            assignment: RwLock::new(Assignment {
                nodes: Vec::new(),
                owners: vec![Vec::new(); partitions.max(1) as usize],
            }),
            partitions: partitions.max(1),
            backups,
            hasher: RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        })
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn version(&self) -> TopologyVersion {
        *self.version.read_recursive()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.assignment.read().nodes.clone()
    }

    pub fn join(&self, node: NodeId) -> TopologyVersion {
        self.change(|nodes| {
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        })
    }

    pub fn leave(&self, node: NodeId) -> TopologyVersion {
        self.change(|nodes| nodes.retain(|n| *n != node))
    }

    /// Pin the owners of one partition (primary first) and bump the version.
    pub fn assign(&self, partition: PartitionId, owners: Vec<NodeId>) -> TopologyVersion {
        let mut version = self.version.write();
        let mut assignment = self.assignment.write();
        if let Some(slot) = assignment.owners.get_mut(partition as usize) {
            *slot = owners;
        }
        *version += 1;
        *version
    }

    fn change(&self, f: impl FnOnce(&mut Vec<NodeId>)) -> TopologyVersion {
        let mut version = self.version.write();
        let mut assignment = self.assignment.write();
        f(&mut assignment.nodes);
        assignment.owners = (0..self.partitions).map(|p| self.owners_for(p, &assignment.nodes)).collect();
        *version += 1;
        debug!(version = *version, nodes = assignment.nodes.len(), "Topology changed");
        *version
    }

    /// Rendezvous hashing: highest score is primary, next `backups` are backups.
    fn owners_for(&self, partition: PartitionId, nodes: &[NodeId]) -> Vec<NodeId> {
        let mut scored: Vec<_> = nodes
            .iter()
            .map(|n| (self.hasher.hash_one((partition, n)), *n))
            .collect();
        scored.sort_unstable_by(|a, b| b.cmp(a));
        scored.into_iter().take(1 + self.backups).map(|(_, n)| n).collect()
    }

    fn partition_of(&self, key: &str) -> PartitionId {
        (self.hasher.hash_one(key) % u64::from(self.partitions)) as PartitionId
    }

    fn owners(&self, partition: PartitionId) -> Vec<NodeId> {
        self.assignment
            .read()
            .owners
            .get(partition as usize)
            .cloned()
            .unwrap_or_default()
    }
}

/// One node's view of a [`ClusterState`].
pub struct InMemoryTopology {
    cluster: Arc<ClusterState>,
    local: NodeId,
    readers: DashMap<CacheKey, HashSet<NodeId>>,
    moving: RwLock<HashSet<PartitionId>>,
    partition_locks: Vec<Mutex<()>>,
    evicted_while_moving: DashMap<PartitionId, Vec<(CacheKey, Version)>>,
}

impl InMemoryTopology {
    pub fn new(cluster: Arc<ClusterState>, local: NodeId) -> Self {
        let partition_locks = (0..cluster.partitions()).map(|_| Mutex::new(())).collect();
        Self {
            cluster,
            local,
            readers: DashMap::new(),
            moving: RwLock::new(HashSet::new()),
            partition_locks,
            evicted_while_moving: DashMap::new(),
        }
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    /// Record that `node` holds `key` in its near cache.
    pub fn add_reader(&self, key: impl Into<CacheKey>, node: NodeId) {
        self.readers.entry(key.into()).or_default().insert(node);
    }

    pub fn set_moving(&self, partition: PartitionId, moving: bool) {
        let mut set = self.moving.write();
        if moving {
            set.insert(partition);
        } else {
            set.remove(&partition);
        }
    }

    /// Keys evicted while their partition was moving.
    pub fn evicted_while_moving(&self, partition: PartitionId) -> Vec<(CacheKey, Version)> {
        self.evicted_while_moving
            .get(&partition)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }
}

impl PartitionTopology for InMemoryTopology {
    fn read_lock(&self) -> RwLockReadGuard<'_, TopologyVersion> {
        self.cluster.version.read_recursive()
    }

    fn current_version(&self) -> TopologyVersion {
        self.cluster.version()
    }

    fn local_node(&self) -> NodeId {
        self.local
    }

    fn partition(&self, key: &str) -> PartitionId {
        self.cluster.partition_of(key)
    }

    fn nodes_owning(&self, partition: PartitionId, _version: TopologyVersion) -> Vec<NodeId> {
        // Only the latest assignment is kept
        self.cluster.owners(partition)
    }

    fn readers_of(&self, key: &str) -> Vec<NodeId> {
        self.readers
            .get(key)
            .map(|r| r.value().iter().copied().collect())
            .unwrap_or_default()
    }

    fn remove_reader(&self, key: &str, node: NodeId) {
        let emptied = match self.readers.get_mut(key) {
            Some(mut set) => {
                set.remove(&node);
                set.is_empty()
            }
            None => false,
        };
        if emptied {
            self.readers.remove_if(key, |_, set| set.is_empty());
        }
    }

    fn node_alive(&self, node: NodeId) -> bool {
        self.cluster.assignment.read().nodes.contains(&node)
    }

    fn primary_partitions(&self, node: NodeId, _version: TopologyVersion) -> Vec<PartitionId> {
        self.cluster
            .assignment
            .read()
            .owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.first() == Some(&node))
            .map(|(p, _)| p as PartitionId)
            .collect()
    }

    fn lock_if_moving(&self, partition: PartitionId) -> Option<MutexGuard<'_, ()>> {
        if !self.moving.read().contains(&partition) {
            return None;
        }
        self.partition_locks.get(partition as usize).map(|lock| lock.lock())
    }

    fn on_entry_evicted(&self, partition: PartitionId, key: &str, version: Version) {
        self.evicted_while_moving
            .entry(partition)
            .or_default()
            .push((key.to_string(), version));
    }
}
