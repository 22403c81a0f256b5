// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

use super::{EvictionPolicy, PolicyEntry};
use crate::entry::CacheEntry;

/// Evicts the oldest entries once more than `max_size` are tracked.
pub struct FifoPolicy {
    max_size: usize,
    queue: Mutex<VecDeque<Arc<CacheEntry>>>,
}

impl FifoPolicy {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn forget(&self, entry: &Arc<CacheEntry>) {
        if entry.clear_policy_queued() {
            self.queue.lock().retain(|e| !Arc::ptr_eq(e, entry));
        }
    }
}

impl EvictionPolicy for FifoPolicy {
    fn on_entry_accessed(&self, removed: bool, entry: PolicyEntry<'_>) {
        if removed {
            self.forget(entry.entry());
            return;
        }

        // Victims are evicted outside the lock: evicting re-enters the policy
        let victims: Vec<_> = {
            let mut queue = self.queue.lock();
            if entry.entry().try_mark_policy_queued() {
                queue.push_back(Arc::clone(entry.entry()));
            }
            let excess = queue.len().saturating_sub(self.max_size);
            let victims: Vec<_> = queue.drain(..excess).collect();
            for v in &victims {
                v.clear_policy_queued();
            }
            victims
        };

        for victim in victims {
            trace!(key = %victim.key(), "FIFO policy evicting");
            if !entry.evictor().evict(&victim) && !victim.obsolete_or_deleted() && victim.try_mark_policy_queued() {
                self.queue.lock().push_back(victim);
            }
        }
    }
}
