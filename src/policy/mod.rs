// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pluggable eviction policy and filter.
//!
//! The coordinator tells the policy about every access and removal; the
//! policy decides which entries to give up and asks for them through the
//! [`Evictor`] it is handed. Ranking is entirely the policy's business.

pub mod fifo;

use std::sync::Arc;

use crate::entry::CacheEntry;

pub use fifo::FifoPolicy;

/// Evicts entries on behalf of a policy.
pub trait Evictor: Send + Sync {
    /// Returns `true` if the entry was evicted or accepted for synchronized eviction.
    fn evict(&self, entry: &Arc<CacheEntry>) -> bool;
}

/// What a policy sees on each notification.
pub struct PolicyEntry<'a> {
    entry: &'a Arc<CacheEntry>,
    evictor: &'a dyn Evictor,
}

impl<'a> PolicyEntry<'a> {
    pub fn new(entry: &'a Arc<CacheEntry>, evictor: &'a dyn Evictor) -> Self {
        Self { entry, evictor }
    }

    pub fn entry(&self) -> &'a Arc<CacheEntry> {
        self.entry
    }

    pub fn evictor(&self) -> &'a dyn Evictor {
        self.evictor
    }

    /// Evict this entry.
    pub fn evict(&self) -> bool {
        self.evictor.evict(self.entry)
    }
}

pub trait EvictionPolicy: Send + Sync {
    /// `removed` is set when the entry is obsolete or has no value left;
    /// the policy should forget it.
    fn on_entry_accessed(&self, removed: bool, entry: PolicyEntry<'_>);
}

/// Veto on eviction of individual entries.
pub trait EvictionFilter: Send + Sync {
    fn evict_allowed(&self, entry: &CacheEntry) -> bool;
}

impl<F> EvictionFilter for F
where
    F: Fn(&CacheEntry) -> bool + Send + Sync,
{
    fn evict_allowed(&self, entry: &CacheEntry) -> bool {
        self(entry)
    }
}
