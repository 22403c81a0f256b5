// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local eviction queue.
//!
//! Candidates wait here until enough of them accumulate to form a batch.
//! Ordering lives in a lock-free [`SegQueue`] of tickets; the candidates
//! themselves live in a concurrent map keyed by ticket, so unlinking a node
//! is a map removal and `drain` simply skips tickets that are gone.
//! Tickets of removed nodes are compacted out of the order once they
//! outnumber the live candidates.
//!
//! Each entry stores the ticket of its queue node as a back-reference. The
//! back-reference is installed with a CAS, which is what keeps an entry from
//! being queued twice.

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::entry::{CacheEntry, CacheKey, EntryPredicate};
use crate::version::Version;

/// Lower bound on the queue capacity target, whatever the cache size.
pub const MIN_QUEUE_TARGET: usize = 500;

/// Dead tickets tolerated on top of the live ones before compacting.
const COMPACT_SLACK: usize = 64;

/// An entry queued for synchronized eviction, with the version seen at enqueue.
#[derive(Clone)]
pub struct EvictionCandidate {
    pub entry: Arc<CacheEntry>,
    pub version: Version,
    pub filter: Option<EntryPredicate>,
    ticket: u64,
}

impl EvictionCandidate {
    pub fn key(&self) -> &CacheKey {
        self.entry.key()
    }

    /// Drop the entry's back-reference so it can be queued again.
    pub(crate) fn release(&self) {
        self.entry.clear_queue_ticket_if(self.ticket);
    }
}

impl fmt::Debug for EvictionCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictionCandidate")
            .field("key", self.key())
            .field("version", &self.version)
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

/// `min(buffer, max(500, cache_size * ratio / 100))`
#[must_use]
pub fn capacity_target(key_buffer_size: usize, cache_size: usize, overflow_ratio: f64) -> usize {
    let overflow = (cache_size as f64 * overflow_ratio / 100.0) as usize;
    key_buffer_size.min(overflow.max(MIN_QUEUE_TARGET))
}

pub struct EvictionQueue {
    order: SegQueue<u64>,
    // Push and pop share it; compaction takes it exclusively to keep order
    order_lock: RwLock<()>,
    live: DashMap<u64, EvictionCandidate>,
    next_ticket: AtomicU64,
    len: AtomicUsize,
}

impl EvictionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            order: SegQueue::new(),
            order_lock: RwLock::new(()),
            live: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            len: AtomicUsize::new(0),
        }
    }

    /// Queue `entry` unless it is already queued.
    ///
    /// Returns `true` if a new candidate was appended.
    pub fn enqueue(&self, entry: &Arc<CacheEntry>, filter: Option<EntryPredicate>) -> bool {
        if entry.queue_ticket() != 0 {
            return false;
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let candidate = EvictionCandidate {
            entry: Arc::clone(entry),
            version: entry.version(),
            filter,
            ticket,
        };
        // Counted before the back-reference is visible, so a concurrent
        // `remove` never decrements below zero
        self.len.fetch_add(1, Ordering::AcqRel);
        self.live.insert(ticket, candidate);

        if !entry.try_set_queue_ticket(ticket) {
            // Lost the race to another enqueue of the same entry
            self.live.remove(&ticket);
            self.len.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        let _order = self.order_lock.read();
        self.order.push(ticket);
        true
    }

    /// Unlink the queued candidate of `entry`, if any.
    pub fn remove(&self, entry: &CacheEntry) -> bool {
        let Some(ticket) = entry.take_queue_ticket() else {
            return false;
        };
        if self.live.remove(&ticket).is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            self.maybe_compact();
            return true;
        }
        false
    }

    /// Rebuild the order without dead tickets when they dominate it.
    fn maybe_compact(&self) {
        if self.order.len() <= self.live.len() * 2 + COMPACT_SLACK {
            return;
        }
        let Some(_order) = self.order_lock.try_write() else {
            return;
        };
        for _ in 0..self.order.len() {
            let Some(ticket) = self.order.pop() else {
                break;
            };
            if self.live.contains_key(&ticket) {
                self.order.push(ticket);
            }
        }
    }

    /// Remove up to `max` candidates in queue order.
    ///
    /// Drained candidates keep their back-reference until the batch that
    /// takes them calls [`EvictionCandidate::release`].
    pub fn drain(&self, max: usize) -> Vec<EvictionCandidate> {
        let mut out = Vec::with_capacity(max.min(self.len()));
        let _order = self.order_lock.read();
        while out.len() < max {
            let Some(ticket) = self.order.pop() else {
                break;
            };
            if let Some((_, candidate)) = self.live.remove(&ticket) {
                self.len.fetch_sub(1, Ordering::AcqRel);
                out.push(candidate);
            }
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tickets held in the order, dead ones included.
    #[cfg(test)]
    fn backlog(&self) -> usize {
        self.order.len()
    }
}

impl Default for EvictionQueue {
    fn default() -> Self {
        Self::new()
    }
}
