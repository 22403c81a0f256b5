// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Primary-partition watcher.
//!
//! With synchronized eviction only primaries feed the policy, so when this
//! node becomes primary for a partition its entries there have never been
//! seen by the policy. The watcher notices and touches them.
//!
//! Events are coalesced: when several are queued only the latest one is
//! acted on, since each pass reads the current topology anyway.

use std::collections::HashSet;
use std::sync::Weak;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::{CoordinatorState, EvictionCoordinator};
use crate::cluster::TopologyEvent;
use crate::entry::PartitionId;

pub(super) async fn run(
    coordinator: Weak<EvictionCoordinator>,
    mut events: mpsc::UnboundedReceiver<TopologyEvent>,
    mut state: watch::Receiver<CoordinatorState>,
) {
    let mut primary = match coordinator.upgrade() {
        Some(c) => c.primary_partitions(),
        None => return,
    };
    debug!(partitions = primary.len(), "Partition watcher started");

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() || !matches!(*state.borrow(), CoordinatorState::Created | CoordinatorState::Running) {
                    break;
                }
            }
            event = events.recv() => {
                let Some(mut event) = event else {
                    break;
                };
                while let Ok(next) = events.try_recv() {
                    event = next;
                }

                let Some(c) = coordinator.upgrade() else {
                    break;
                };
                if c.is_stopping() {
                    break;
                }
                debug!(?event, "Partition watcher processing topology event");
                c.on_primary_change(&mut primary);
            }
        }
    }

    info!("Partition watcher stopped");
}

impl EvictionCoordinator {
    pub(super) fn primary_partitions(&self) -> HashSet<PartitionId> {
        let local = self.topology.local_node();
        self.topology
            .primary_partitions(local, self.topology.current_version())
            .into_iter()
            .collect()
    }

    /// Forget partitions we lost and touch entries of ones we gained.
    pub(super) fn on_primary_change(&self, primary: &mut HashSet<PartitionId>) {
        let Some(_busy) = self.busy.enter() else {
            return;
        };

        let local = self.topology.local_node();
        let version = self.topology.current_version();

        primary.retain(|p| self.topology.is_primary(local, *p, version));

        for partition in self.topology.primary_partitions(local, version) {
            if primary.insert(partition) {
                let entries = self.cache.entries_in_partition(partition);
                debug!(partition, entries = entries.len(), "Became primary; touching partition entries");
                self.touch_on_topology_change(&entries);
            }
        }
    }
}
