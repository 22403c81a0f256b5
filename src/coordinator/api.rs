// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public entry points: touch, evict and the transaction hook.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{EvictionCoordinator, EvictionEvent, FinishedTx};
use crate::config::MemoryMode;
use crate::entry::{CacheEntry, EntryPredicate};
use crate::metrics;
use crate::policy::PolicyEntry;
use crate::storage::LocalCache;
use crate::version::{TopologyVersion, Version};

impl EvictionCoordinator {
    /// Record an access to `entry` at topology version `topology_version`.
    ///
    /// Removes entries that became obsolete, evicts immediately in
    /// `OffheapTiered` mode, and otherwise notifies the policy. With
    /// synchronized eviction only the primary tracks an entry, and the
    /// caller may wait here while too many batches are in flight.
    pub fn touch(&self, entry: &Arc<CacheEntry>, topology_version: TopologyVersion) {
        if entry.is_internal() {
            return;
        }

        if entry.mark_obsolete_if_empty(self.versions.next()) || entry.is_obsolete() {
            self.remove_entry(entry);
        }

        if self.modes.memory_mode == MemoryMode::OffheapTiered {
            self.evict0(&self.cache, entry, self.versions.next(), None, false, "offheap");
            return;
        }

        if !self.modes.policy_enabled {
            return;
        }

        let local = self.topology.local_node();
        if self.modes.evict_sync && !self.topology.is_primary(local, entry.partition(), topology_version) {
            return;
        }

        {
            let Some(_busy) = self.busy.enter() else {
                return;
            };

            if self.modes.sync_any {
                self.wait_for_batches();
            }

            self.notify_policy(entry);
        }

        if self.modes.sync_any {
            self.unwind();
        }
    }

    /// Notify the policy without waiting (used when re-touching rejected
    /// candidates).
    pub(super) fn touch0(&self, entry: &Arc<CacheEntry>) {
        if self.modes.policy_enabled {
            self.notify_policy(entry);
        }
    }

    /// Re-announce entries of partitions this node just became primary for.
    pub fn touch_on_topology_change(&self, entries: &[Arc<CacheEntry>]) {
        if !self.modes.policy_enabled {
            return;
        }
        for entry in entries.iter().filter(|e| !e.is_internal()) {
            self.notify_policy(entry);
        }
    }

    /// Account for the entries of a finished transaction.
    pub fn touch_tx(&self, tx: &FinishedTx) {
        let offheap = self.modes.memory_mode == MemoryMode::OffheapTiered;
        if !self.modes.policy_enabled && !offheap {
            return;
        }

        // Only group-lock system transactions are tracked
        if tx.internal && !tx.group_lock {
            return;
        }

        // Backups are driven by the primary
        if !tx.local && self.modes.evict_sync {
            return;
        }

        {
            let Some(_busy) = self.busy.enter() else {
                return;
            };

            for entry in tx.entries.iter().filter(|e| !e.is_internal()) {
                if entry.mark_obsolete_if_empty(self.versions.next()) || entry.is_obsolete() {
                    self.remove_entry(entry);
                }

                if offheap {
                    self.evict0(&self.cache, entry, self.versions.next(), None, false, "offheap");
                } else {
                    self.notify_policy(entry);
                    if self.modes.sync_any {
                        self.wait_for_batches();
                    }
                }
            }
        }

        if self.modes.sync_any {
            self.unwind();
        }
    }

    /// Evict `entry`, or queue it for synchronized eviction.
    ///
    /// `explicit` marks a user-requested eviction (as opposed to one asked
    /// for by the policy). Returns `true` if the entry was evicted locally or
    /// accepted into the queue; a backup asked by its own policy answers
    /// `true` without doing anything, since the primary drives eviction.
    pub fn evict(
        &self,
        entry: &Arc<CacheEntry>,
        obsolete: Option<Version>,
        explicit: bool,
        filter: Option<EntryPredicate>,
    ) -> bool {
        if entry.is_internal() {
            return false;
        }

        if !explicit && !self.first_evict_warned.swap(true, Ordering::AcqRel) {
            warn!(
                cache = %self.config.cache_name,
                "Evictions started (cache may have reached its capacity). You may wish to increase \
                 the maximum size of the eviction policy to avoid evictions"
            );
        }

        if !self.modes.sync_any {
            let obsolete = obsolete.unwrap_or_else(|| self.versions.next());
            return self.evict0(&self.cache, entry, obsolete, filter.as_ref(), explicit, "local");
        }

        if self.modes.evict_sync {
            let local = self.topology.local_node();
            if !self.topology.is_primary(local, entry.partition(), self.topology.current_version()) {
                return !explicit;
            }
        }

        if let Some(filter) = &filter {
            if !filter(&*entry.lock_state()) {
                return false;
            }
        }

        // Entry is being updated; it will be touched again when the lock is released
        if entry.locked_by_any() {
            return false;
        }

        if self.queue.enqueue(entry, filter) {
            metrics::set_queue_size(self.queue.len());
        }
        true
    }

    /// Evict `entry` from `cache` right now.
    ///
    /// Returns `true` if the entry was marked obsolete and removed.
    pub(super) fn evict0(
        &self,
        cache: &LocalCache,
        entry: &Arc<CacheEntry>,
        obsolete: Version,
        filter: Option<&EntryPredicate>,
        explicit: bool,
        path: &'static str,
    ) -> bool {
        let swap = if self.modes.swap_or_offheap { self.swap.as_deref() } else { None };

        match entry.evict_internal(obsolete, filter, swap) {
            Ok(Some(evicted)) => {
                if explicit && self.modes.policy_enabled {
                    self.notify_policy(entry);
                }

                cache.remove_entry(entry);
                self.queue.remove(entry);
                self.publish(entry, evicted.old_value);
                metrics::record_evicted(path, 1);

                debug!(key = %entry.key(), path, "Entry was evicted");
                true
            }
            Ok(None) => {
                debug!(key = %entry.key(), path, "Entry was not evicted");
                false
            }
            Err(e) => {
                warn!(key = %entry.key(), error = %e, "Failed to evict entry");
                false
            }
        }
    }

    /// Hand `entry` to the policy, unless the filter vetoes it.
    pub(super) fn notify_policy(&self, entry: &Arc<CacheEntry>) {
        let Some(policy) = &self.policy else {
            return;
        };

        if let Some(filter) = &self.filter {
            if !filter.evict_allowed(entry) {
                return;
            }
        }

        policy.on_entry_accessed(entry.obsolete_or_deleted(), PolicyEntry::new(entry, self));
    }

    pub(super) fn remove_entry(&self, entry: &Arc<CacheEntry>) {
        self.cache.remove_entry(entry);
        self.queue.remove(entry);
    }

    /// Publish an eviction event if anyone is listening.
    pub(super) fn publish(&self, entry: &CacheEntry, old_value: Option<crate::entry::CacheValue>) {
        if self.events.receiver_count() == 0 {
            return;
        }
        // No receivers left is not an error here
        let _ = self.events.send(EvictionEvent {
            key: entry.key().clone(),
            partition: entry.partition(),
            node: self.topology.local_node(),
            old_value,
        });
    }

    /// Bounded wait while the batch ceiling is reached.
    pub(super) fn wait_for_batches(&self) {
        let wake = Duration::from_millis(self.config.backpressure_wait_ms.max(1));
        if let Some(waited) = self.gate.wait_for_room(wake, &self.stopping) {
            debug!(waited_ms = waited.as_millis() as u64, "Waited for eviction batches");
            metrics::record_backpressure_wait(waited);
        }
    }
}
