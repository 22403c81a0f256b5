// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the eviction coordinator.

use std::sync::Arc;

use crate::cluster::NodeId;
use crate::entry::{CacheEntry, CacheKey, CacheValue, PartitionId};

/// Coordinator lifecycle state.
///
/// Use [`super::EvictionCoordinator::state()`] to check the current state or
/// [`super::EvictionCoordinator::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Built, watcher not started
    Created,
    /// Accepting work
    Running,
    /// Shutdown in progress; new work is refused
    Stopping,
    /// Shutdown complete, all batches cancelled
    Stopped,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// An entry left memory on this node.
///
/// Only published while someone is subscribed; `old_value` is captured only
/// in that case.
#[derive(Debug, Clone)]
pub struct EvictionEvent {
    pub key: CacheKey,
    pub partition: PartitionId,
    /// Node that evicted the entry (always the local node)
    pub node: NodeId,
    pub old_value: Option<CacheValue>,
}

impl EvictionEvent {
    pub fn had_value(&self) -> bool {
        self.old_value.is_some()
    }
}

/// Point-in-time counters for dashboards and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionStats {
    /// Entries waiting in the eviction queue
    pub queue_size: usize,
    /// Batches preparing or awaiting responses
    pub in_flight_batches: usize,
    /// Batches created since start
    pub batches_created: u64,
    /// The first-eviction warning has been logged
    pub first_evict_warned: bool,
}

/// A transaction that has just finished, as seen by eviction.
#[derive(Debug, Clone, Default)]
pub struct FinishedTx {
    /// Entries the transaction touched
    pub entries: Vec<Arc<CacheEntry>>,
    /// Started on this node
    pub local: bool,
    /// System transaction (skipped unless it is a group-lock one)
    pub internal: bool,
    pub group_lock: bool,
}

impl FinishedTx {
    pub fn local(entries: Vec<Arc<CacheEntry>>) -> Self {
        Self { entries, local: true, ..Default::default() }
    }

    pub fn remote(entries: Vec<Arc<CacheEntry>>) -> Self {
        Self { entries, local: false, ..Default::default() }
    }
}
