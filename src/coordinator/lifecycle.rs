// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coordinator lifecycle: start and shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{watcher, CoordinatorState, EvictionBatch, EvictionCoordinator};
use crate::cluster::TopologyEvent;
use crate::error::EvictionError;

/// How long shutdown waits for operations already inside the coordinator.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

impl EvictionCoordinator {
    /// Start the coordinator.
    ///
    /// Spawns the primary-partition watcher when eviction is synchronized
    /// with backups and a policy is installed. The watcher is fed one
    /// synthetic join event for the local node so that it runs a first pass
    /// over the current topology.
    #[tracing::instrument(skip(self), fields(cache = %self.config.cache_name))]
    pub async fn start(self: &Arc<Self>) -> Result<(), EvictionError> {
        match self.state() {
            CoordinatorState::Created => {}
            CoordinatorState::Running => {
                debug!("Coordinator already running");
                return Ok(());
            }
            CoordinatorState::Stopping | CoordinatorState::Stopped => return Err(EvictionError::Stopping),
        }

        if self.modes.evict_sync && self.modes.policy_enabled {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(TopologyEvent::NodeJoined(self.topology.local_node()));
            *self.watcher_tx.lock() = Some(tx);

            let handle = tokio::spawn(watcher::run(Arc::downgrade(self), rx, self.state.subscribe()));
            *self.watcher.lock() = Some(handle);
        }

        let _ = self.state.send(CoordinatorState::Running);
        info!(
            evict_sync = self.modes.evict_sync,
            near_sync = self.modes.near_sync,
            policy = self.modes.policy_enabled,
            memory_mode = ?self.modes.memory_mode,
            "Eviction coordinator started"
        );
        Ok(())
    }

    /// Stop the coordinator.
    ///
    /// Refuses new work, wakes callers waiting on the batch ceiling, waits
    /// for operations already inside to leave, stops the watcher and cancels
    /// every batch still in flight. Cancelled batches neither evict nor
    /// re-touch their entries.
    #[tracing::instrument(skip(self), fields(cache = %self.config.cache_name))]
    pub async fn shutdown(self: &Arc<Self>) {
        if matches!(self.state(), CoordinatorState::Stopping | CoordinatorState::Stopped) {
            return;
        }
        let started = Instant::now();
        info!("Shutting down eviction coordinator");
        let _ = self.state.send(CoordinatorState::Stopping);

        self.stopping.store(true, Ordering::Release);
        self.gate.wake_all();

        let me = Arc::clone(self);
        match tokio::task::spawn_blocking(move || me.busy.block(DRAIN_TIMEOUT)).await {
            Ok(true) => {}
            Ok(false) => warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "Operations still active after drain timeout"),
            Err(e) => warn!(error = %e, "Drain task failed"),
        }

        self.watcher_tx.lock().take();
        let handle = self.watcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Partition watcher ended abnormally");
            }
        }

        let collecting = self.current_batch.lock().take();
        if let Some(batch) = collecting {
            batch.cancel();
        }

        let in_flight: Vec<Arc<EvictionBatch>> = self.batches.iter().map(|b| Arc::clone(b.value())).collect();
        let cancelled = in_flight.iter().filter(|b| b.cancel()).count();

        let _ = self.state.send(CoordinatorState::Stopped);
        info!(
            cancelled_batches = cancelled,
            duration_ms = started.elapsed().as_millis() as u64,
            "Eviction coordinator stopped"
        );
    }
}
