// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk eviction to swap.
//!
//! Entries are locked in key order (so two bulk evictions can never
//! deadlock), snapshotted into swap records, and unlocked in reverse order.
//! The records go out in one `write_all` call. Only after the write succeeds
//! is each entry marked obsolete, and only if its version did not move in
//! the meantime.

use std::sync::Arc;
use tracing::{debug, warn};

use super::EvictionCoordinator;
use crate::entry::{CacheEntry, CacheKey};
use crate::metrics;
use crate::storage::swap::SwapEntry;
use crate::version::Version;

impl EvictionCoordinator {
    /// Evict `keys` to swap in one write. Returns the number of entries evicted.
    ///
    /// Only available when eviction is not synchronized and swap or off-heap
    /// storage is enabled; otherwise nothing happens.
    pub fn batch_evict(&self, keys: &[CacheKey], obsolete: Option<Version>) -> usize {
        if self.modes.sync_any || !self.modes.swap_or_offheap {
            warn!(
                cache = %self.config.cache_name,
                "Bulk eviction needs swap or off-heap storage and unsynchronized eviction"
            );
            return 0;
        }

        let Some(swap) = &self.swap else {
            warn!(cache = %self.config.cache_name, "Bulk eviction requested without a swap store");
            return 0;
        };

        let Some(_busy) = self.busy.enter() else {
            return 0;
        };

        let mut entries: Vec<Arc<CacheEntry>> = keys
            .iter()
            .filter_map(|k| self.cache.peek(k))
            .filter(|e| !e.is_internal())
            .collect();
        entries.sort_by(|a, b| a.key().cmp(b.key()));
        entries.dedup_by(|a, b| Arc::ptr_eq(a, b));

        let obsolete = obsolete.unwrap_or_else(|| self.versions.next());

        let mut records = Vec::with_capacity(entries.len());
        let mut planned: Vec<(Arc<CacheEntry>, Version)> = Vec::with_capacity(entries.len());
        {
            let mut guards = Vec::with_capacity(entries.len());
            for entry in &entries {
                let state = entry.lock_state();
                if !state.is_obsolete() && !entry.locked_by_any() {
                    match SwapEntry::from_state(entry.key(), entry.partition(), &state) {
                        Ok(record) => {
                            records.extend(record);
                            planned.push((Arc::clone(entry), *state.version()));
                        }
                        Err(e) => warn!(key = %entry.key(), error = %e, "Entry not swappable; kept in memory"),
                    }
                }
                guards.push(state);
            }
            while let Some(guard) = guards.pop() {
                drop(guard);
            }
        }

        if !records.is_empty() {
            let count = records.len();
            match swap.write_all(records) {
                Ok(()) => metrics::record_swap_write(count, true),
                Err(e) => {
                    metrics::record_swap_write(count, false);
                    warn!(error = %e, records = count, "Swap write failed; entries stay in memory");
                    return 0;
                }
            }
        }

        let mut evicted = 0usize;
        for (entry, version) in planned {
            let Some(done) = entry.mark_obsolete_if_version(&version, obsolete) else {
                debug!(key = %entry.key(), "Entry changed during bulk eviction; skipped");
                continue;
            };

            self.remove_entry(&entry);
            self.touch0(&entry);
            self.publish(&entry, done.old_value);
            evicted += 1;
        }

        metrics::record_evicted("swap", evicted);
        debug!(requested = keys.len(), evicted, "Bulk eviction finished");
        evicted
    }
}
