// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synchronized eviction protocol: batch formation, preparation,
//! completion, and serving peers' requests.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::batch::{BatchOutcome, CompletionCause, EvictionBatch};
use super::EvictionCoordinator;
use crate::cluster::messaging::{EvictionMessage, EvictionRequest, EvictionResponse, MessagingError, RequestEntry};
use crate::cluster::{NodeId, TopologyEvent};
use crate::entry::{EntryPredicate, EntryState, PartitionId};
use crate::error::EvictionError;
use crate::metrics;
use crate::storage::LocalCache;
use crate::version::{TopologyVersion, Version};

impl EvictionCoordinator {
    /// Let queued evictions make progress.
    ///
    /// Called after cache operations. Cheap when nothing is queued.
    pub fn unwind(&self) {
        if !self.modes.sync_any {
            return;
        }
        let Some(_busy) = self.busy.enter() else {
            return;
        };
        self.check_eviction_queue();
    }

    /// Move queued entries into batches and dispatch full ones.
    fn check_eviction_queue(&self) {
        let target = self.queue_target();
        let mut ready = Vec::new();

        {
            let mut slot = self.current_batch.lock();
            loop {
                if let Some(batch) = slot.as_ref() {
                    if batch.len() >= target.max(1) {
                        if !self.gate.try_acquire() {
                            debug!(batch_id = batch.id(), "Batch ceiling reached; full batch waits");
                            break;
                        }
                        if let Some(batch) = slot.take() {
                            ready.push(batch);
                        }
                        continue;
                    }
                }

                let queued = self.queue.len();
                if queued == 0 || queued < target {
                    break;
                }

                let drained = self.queue.drain(target.max(1));
                if drained.is_empty() {
                    break;
                }
                let batch = slot.get_or_insert_with(|| self.new_batch());
                if let Err(refused) = batch.add(drained) {
                    // Slot only ever holds collecting batches
                    warn!(batch_id = batch.id(), "Collecting batch refused candidates");
                    for c in refused {
                        c.release();
                    }
                    break;
                }
            }
        }

        metrics::set_queue_size(self.queue.len());
        metrics::set_in_flight_batches(self.gate.in_flight());

        for batch in ready {
            self.prepare_batch(batch);
        }
    }

    /// Resolve participants, evict what needs no confirmation, send requests.
    fn prepare_batch(&self, batch: Arc<EvictionBatch>) {
        let batch_id = batch.id();
        self.batches.insert(batch_id, Arc::clone(&batch));

        let me = self.me.clone();
        batch.on_complete(Box::new(move |outcome| {
            if let Some(coordinator) = me.upgrade() {
                coordinator.on_batch_completed(outcome);
            }
        }));

        let needs_remote = {
            let guard = self.topology.read_lock();
            let topology_version = *guard;

            let Some(collected) = batch.begin_prepare(topology_version) else {
                return;
            };
            metrics::record_batch_started(collected.len());

            let local = self.topology.local_node();
            let mut local_only = Vec::new();

            for candidate in collected {
                candidate.release();

                let backups: Vec<NodeId> = if self.modes.evict_sync {
                    self.topology
                        .nodes_owning(candidate.entry.partition(), topology_version)
                        .into_iter()
                        .filter(|n| *n != local)
                        .collect()
                } else {
                    Vec::new()
                };

                let readers: Vec<NodeId> = if self.modes.near_sync {
                    self.topology
                        .readers_of(candidate.key())
                        .into_iter()
                        .filter(|n| *n != local && self.topology.node_alive(*n))
                        .collect()
                } else {
                    Vec::new()
                };

                if backups.is_empty() && readers.is_empty() {
                    local_only.push(candidate);
                } else {
                    batch.track(candidate, &backups, &readers);
                }
            }

            if !local_only.is_empty() {
                let obsolete = self.versions.next();
                for candidate in local_only {
                    let filter = Self::version_filter(&candidate);
                    if !self.evict0(&self.cache, &candidate.entry, obsolete, Some(&filter), false, "local") {
                        self.touch0(&candidate.entry);
                    }
                }
            }

            batch.has_candidates()
        };

        if !needs_remote {
            batch.complete(CompletionCause::Empty);
            return;
        }

        for (node, request) in batch.requests() {
            debug!(batch_id, node = %node, keys = request.entries.len(), "Sending eviction request");
            match self.messaging.send(node, EvictionMessage::Request(request)) {
                Ok(()) => {}
                Err(MessagingError::NodeLeft(_)) => {
                    debug!(batch_id, node = %node, "Node left before eviction request was sent");
                    metrics::record_send_failure("node_left");
                    batch.on_node_left(node);
                }
                Err(e) => {
                    let err = EvictionError::from(e);
                    error!(batch_id, node = %node, error = %err, "Failed to send eviction request");
                    metrics::record_send_failure("transport");
                    batch.reject_node(node);
                }
            }
        }

        batch.register_timeout(self.config.batch_timeout());
        batch.finish_prepare();
    }

    /// Continuation run once per prepared batch.
    fn on_batch_completed(&self, outcome: &BatchOutcome) {
        self.batches.remove(&outcome.batch_id);
        let cancelled = outcome.cause == CompletionCause::Cancelled;

        if !cancelled {
            if let Some(_busy) = self.busy.enter() {
                let guard = self.topology.read_lock();
                self.apply_outcome(outcome, *guard);
            }
        }

        self.gate.release();
        metrics::set_in_flight_batches(self.gate.in_flight());

        // A full batch may be waiting for the slot just freed
        if !cancelled && !self.is_stopping() {
            self.unwind();
        }
    }

    fn apply_outcome(&self, outcome: &BatchOutcome, topology_version: TopologyVersion) {
        if topology_version != outcome.topology_version {
            debug!(
                batch_id = outcome.batch_id,
                prepared = outcome.topology_version,
                current = topology_version,
                "Topology changed while batch was in flight; touching all entries"
            );
            for candidate in outcome.evicted.iter().chain(outcome.rejected.iter()) {
                self.touch0(&candidate.entry);
            }
            return;
        }

        let obsolete = self.versions.next();
        let mut evicted = 0usize;
        for candidate in &outcome.evicted {
            if let Some(readers) = outcome.evicted_readers.get(candidate.key()) {
                for reader in readers {
                    self.topology.remove_reader(candidate.key(), *reader);
                }
            }

            // An entry updated meanwhile stays; the update re-touches it
            let filter = Self::version_filter(candidate);
            if self.evict0(&self.cache, &candidate.entry, obsolete, Some(&filter), false, "sync") {
                evicted += 1;
            }
        }

        for candidate in &outcome.rejected {
            self.touch0(&candidate.entry);
        }

        debug!(
            batch_id = outcome.batch_id,
            evicted,
            rejected = outcome.rejected.len(),
            "Applied eviction batch outcome"
        );
    }

    // --- Messaging ---

    /// Dispatch an eviction message received from `from`.
    pub fn on_message(&self, from: NodeId, message: EvictionMessage) {
        match message {
            EvictionMessage::Request(request) => self.process_request(from, request),
            EvictionMessage::Response(response) => self.process_response(from, response),
        }
    }

    /// Serve a peer's request to evict keys it is primary for.
    pub fn process_request(&self, from: NodeId, request: EvictionRequest) {
        let Some(_busy) = self.busy.enter() else {
            return;
        };

        let batch_id = request.batch_id;

        let response = if let Some(cause) = &request.class_error {
            debug!(batch_id, node = %from, error = %cause, "Eviction request could not be decoded");
            EvictionResponse::error(batch_id)
        } else {
            let guard = self.topology.read_lock();
            let local_version = *guard;
            if local_version != request.topology_version {
                let err = EvictionError::TopologyMismatch {
                    local: local_version,
                    remote: request.topology_version,
                };
                debug!(batch_id, node = %from, error = %err, "Rejecting eviction request");

                let mut response = EvictionResponse::new(batch_id);
                for key in request.keys() {
                    response.reject(key.clone());
                }
                response
            } else {
                self.process_request0(&request, local_version)
            }
        };

        metrics::record_request_served(request.entries.len(), response.rejected_keys.len());

        match self.messaging.send(from, EvictionMessage::Response(response)) {
            Ok(()) => {}
            Err(MessagingError::NodeLeft(_)) => {
                debug!(batch_id, node = %from, "Requesting node left before response was sent");
                metrics::record_send_failure("node_left");
            }
            Err(e) => {
                error!(batch_id, node = %from, error = %e, "Failed to send eviction response");
                metrics::record_send_failure("transport");
            }
        }
    }

    /// Evict requested keys under the topology read lock.
    fn process_request0(&self, request: &EvictionRequest, topology_version: TopologyVersion) -> EvictionResponse {
        let mut response = EvictionResponse::new(request.batch_id);
        let local = self.topology.local_node();
        let obsolete = self.versions.next();

        let mut by_partition: BTreeMap<PartitionId, Vec<&RequestEntry>> = BTreeMap::new();
        let mut near = Vec::new();
        for entry in &request.entries {
            if entry.near {
                near.push(entry);
            } else {
                by_partition.entry(self.topology.partition(&entry.key)).or_default().push(entry);
            }
        }

        for (partition, entries) in by_partition {
            let owned = self.topology.nodes_owning(partition, topology_version).contains(&local);

            // Keep the preloader from bringing keys back while we evict
            let lock = if self.config.preload_enabled {
                self.topology.lock_if_moving(partition)
            } else {
                None
            };
            let locked = lock.is_some();

            for entry in entries {
                let evicted = owned && self.evict_locally(&self.cache, entry, obsolete);
                if !owned {
                    debug!(key = %entry.key, partition, "Not an owner of requested key's partition");
                }
                if locked && evicted {
                    self.topology.on_entry_evicted(partition, &entry.key, entry.version);
                }
                if !evicted {
                    response.reject(entry.key.clone());
                }
            }

            drop(lock);
        }

        for entry in near {
            let evicted = match &self.near_cache {
                Some(near_cache) => self.evict_locally(near_cache, entry, obsolete),
                None => true,
            };
            if !evicted {
                response.reject(entry.key.clone());
            }
        }

        response
    }

    /// Evict a requested key if it still has the primary's version.
    /// A key that is not present counts as evicted.
    fn evict_locally(&self, cache: &LocalCache, requested: &RequestEntry, obsolete: Version) -> bool {
        let Some(entry) = cache.peek(&requested.key) else {
            return true;
        };

        if entry.version() != requested.version {
            let err = EvictionError::VersionConflict { key: requested.key.clone() };
            debug!(error = %err, local = %entry.version(), requested = %requested.version, "Rejecting key");
            return false;
        }

        let expected = requested.version;
        let filter: EntryPredicate = Arc::new(move |state: &EntryState| *state.version() == expected);
        self.evict0(cache, &entry, obsolete, Some(&filter), false, "remote")
    }

    /// Record a peer's response to one of our batches.
    pub fn process_response(&self, from: NodeId, response: EvictionResponse) {
        let Some(_busy) = self.busy.enter() else {
            return;
        };

        let batch_id = response.batch_id;
        match self.batch(batch_id) {
            Some(batch) => {
                let alive = self.topology.node_alive(from);
                batch.on_response(from, response, alive);
            }
            None => debug!(batch_id, node = %from, "Response for unknown or finished eviction batch"),
        }
    }

    /// Feed a membership change to in-flight batches and the watcher.
    pub fn on_topology_event(&self, event: TopologyEvent) {
        self.versions.on_topology_changed(self.topology.current_version());

        if event.is_departure() {
            let node = event.node();
            let batches: Vec<Arc<EvictionBatch>> = self.batches.iter().map(|b| Arc::clone(b.value())).collect();
            debug!(node = %node, batches = batches.len(), "Node left; updating eviction batches");
            for batch in batches {
                batch.on_node_left(node);
            }
        }

        if let Some(tx) = self.watcher_tx.lock().as_ref() {
            if tx.send(event).is_err() {
                debug!("Partition watcher is gone; dropping topology event");
            }
        }
    }
}
