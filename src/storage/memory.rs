// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use dashmap::DashMap;
use std::sync::Arc;

use crate::entry::{CacheEntry, CacheKey, CacheValue, PartitionId};
use crate::version::Version;

/// Concurrent key → entry map. Owns the entries the eviction subsystem
/// only references.
pub struct LocalCache {
    data: DashMap<CacheKey, Arc<CacheEntry>>,
}

impl LocalCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Insert or overwrite an entry and return the stored handle.
    pub fn put(&self, key: impl Into<CacheKey>, partition: PartitionId, value: CacheValue, version: Version) -> Arc<CacheEntry> {
        let key = key.into();
        if let Some(existing) = self.data.get(&key) {
            if existing.update(Some(value.clone()), version) {
                return Arc::clone(existing.value());
            }
        }
        let entry = Arc::new(CacheEntry::new(key.clone(), partition, Some(value), version));
        self.data.insert(key, Arc::clone(&entry));
        entry
    }

    /// Insert a prebuilt entry (internal entries, tests).
    pub fn insert(&self, entry: Arc<CacheEntry>) {
        self.data.insert(entry.key().clone(), entry);
    }

    /// Look up without touching eviction state.
    pub fn peek(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.data.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Remove `entry` from the map, but only if the map still holds that
    /// same entry (a newer entry under the same key is left alone).
    pub fn remove_entry(&self, entry: &Arc<CacheEntry>) -> bool {
        self.data
            .remove_if(entry.key(), |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    pub fn entries_in_partition(&self, partition: PartitionId) -> Vec<Arc<CacheEntry>> {
        self.data
            .iter()
            .filter(|r| r.value().partition() == partition)
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    /// Number of live (non-obsolete) entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.iter().filter(|r| !r.value().is_obsolete()).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}
