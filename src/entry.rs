// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache entries as seen by the eviction subsystem.
//!
//! Entries are owned by the cache map ([`crate::storage::LocalCache`]); the
//! eviction subsystem only holds `Arc` references looked up by key. Mutable
//! state sits behind a per-entry mutex, which doubles as the entry lock taken
//! by the bulk swap eviction path.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::EvictionError;
use crate::storage::swap::SwapEntry;
use crate::storage::traits::SwapStore;
use crate::version::Version;

pub type CacheKey = String;
pub type PartitionId = u32;

/// Predicate evaluated against the locked entry state before removal.
pub type EntryPredicate = Arc<dyn Fn(&EntryState) -> bool + Send + Sync>;

/// Entry value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheValue {
    /// Raw bytes, stored as-is.
    Bytes(Vec<u8>),
    /// Structured value, serialized on swap-out.
    Json(serde_json::Value),
    /// Value already resident off-heap.
    OffHeap { address: u64, len: u32 },
}

impl CacheValue {
    #[must_use]
    pub fn is_byte_array(&self) -> bool {
        matches!(self, Self::Bytes(_))
    }
}

/// Mutable part of an entry, guarded by the entry mutex.
#[derive(Debug, Clone)]
pub struct EntryState {
    value: Option<CacheValue>,
    version: Version,
    ttl: i64,
    expire_time: i64,
    obsolete: Option<Version>,
}

impl EntryState {
    pub fn value(&self) -> Option<&CacheValue> {
        self.value.as_ref()
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub fn expire_time(&self) -> i64 {
        self.expire_time
    }

    pub fn obsolete_version(&self) -> Option<&Version> {
        self.obsolete.as_ref()
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.is_some()
    }

    pub(crate) fn mark_obsolete(&mut self, obsolete: Version) -> Option<CacheValue> {
        self.obsolete = Some(obsolete);
        self.value.take()
    }
}

/// Result of a successful local eviction.
#[derive(Debug, Clone)]
pub struct Evicted {
    pub old_value: Option<CacheValue>,
}

/// A cache entry.
pub struct CacheEntry {
    key: CacheKey,
    partition: PartitionId,
    internal: bool,
    state: Mutex<EntryState>,
    /// Transactions currently holding a lock on this entry
    tx_locks: AtomicUsize,
    /// Back-reference to the eviction queue node (0 = not queued)
    queue_ticket: AtomicU64,
    /// Back-reference used by the FIFO policy
    policy_queued: AtomicBool,
}

impl CacheEntry {
    pub fn new(key: impl Into<CacheKey>, partition: PartitionId, value: Option<CacheValue>, version: Version) -> Self {
        Self::build(key.into(), partition, value, version, false)
    }

    /// System entry; never evicted.
    pub fn new_internal(key: impl Into<CacheKey>, partition: PartitionId, value: Option<CacheValue>, version: Version) -> Self {
        Self::build(key.into(), partition, value, version, true)
    }

    fn build(key: CacheKey, partition: PartitionId, value: Option<CacheValue>, version: Version, internal: bool) -> Self {
        Self {
            key,
            partition,
            internal,
            state: Mutex::new(EntryState {
                value,
                version,
                ttl: 0,
                expire_time: 0,
                obsolete: None,
            }),
            tx_locks: AtomicUsize::new(0),
            queue_ticket: AtomicU64::new(0),
            policy_queued: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn version(&self) -> Version {
        self.state.lock().version
    }

    pub fn value(&self) -> Option<CacheValue> {
        self.state.lock().value.clone()
    }

    pub fn has_value(&self) -> bool {
        self.state.lock().value.is_some()
    }

    pub fn is_obsolete(&self) -> bool {
        self.state.lock().obsolete.is_some()
    }

    /// Snapshot of the mutable state.
    pub fn snapshot(&self) -> EntryState {
        self.state.lock().clone()
    }

    /// Apply a write. Returns `false` if the entry is already obsolete.
    pub fn update(&self, value: Option<CacheValue>, version: Version) -> bool {
        let mut state = self.state.lock();
        if state.obsolete.is_some() {
            return false;
        }
        state.value = value;
        state.version = version;
        true
    }

    pub fn set_ttl(&self, ttl: i64, expire_time: i64) {
        let mut state = self.state.lock();
        state.ttl = ttl;
        state.expire_time = expire_time;
    }

    pub fn lock_tx(&self) {
        self.tx_locks.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlock_tx(&self) {
        let _ = self.tx_locks.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn locked_by_any(&self) -> bool {
        self.tx_locks.load(Ordering::Acquire) > 0
    }

    /// Obsolete entries and entries without a value are reported to the
    /// policy as removed.
    pub fn obsolete_or_deleted(&self) -> bool {
        let state = self.state.lock();
        state.obsolete.is_some() || state.value.is_none()
    }

    /// Mark the entry obsolete if it holds no value and no transaction uses it.
    pub fn mark_obsolete_if_empty(&self, obsolete: Version) -> bool {
        if self.locked_by_any() {
            return false;
        }
        let mut state = self.state.lock();
        if state.obsolete.is_none() && state.value.is_none() {
            state.obsolete = Some(obsolete);
            return true;
        }
        false
    }

    // --- Queue back-reference ---

    pub(crate) fn queue_ticket(&self) -> u64 {
        self.queue_ticket.load(Ordering::Acquire)
    }

    /// Install the back-reference; loses if another ticket is present.
    pub(crate) fn try_set_queue_ticket(&self, ticket: u64) -> bool {
        self.queue_ticket
            .compare_exchange(0, ticket, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Remove the back-reference, returning the ticket that was stored.
    pub(crate) fn take_queue_ticket(&self) -> Option<u64> {
        match self.queue_ticket.swap(0, Ordering::AcqRel) {
            0 => None,
            t => Some(t),
        }
    }

    pub(crate) fn clear_queue_ticket_if(&self, ticket: u64) -> bool {
        self.queue_ticket
            .compare_exchange(ticket, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // --- Policy back-reference ---

    pub(crate) fn try_mark_policy_queued(&self) -> bool {
        self.policy_queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn clear_policy_queued(&self) -> bool {
        self.policy_queued.swap(false, Ordering::AcqRel)
    }

    // --- Eviction ---

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock()
    }

    /// Evict under the entry lock.
    ///
    /// Returns `Ok(None)` when the entry is obsolete, locked by a transaction,
    /// or rejected by `filter`. With a swap store the value is written out
    /// before the entry is marked obsolete; a failed write leaves it intact.
    pub(crate) fn evict_internal(
        &self,
        obsolete: Version,
        filter: Option<&EntryPredicate>,
        swap: Option<&dyn SwapStore>,
    ) -> Result<Option<Evicted>, EvictionError> {
        if self.internal || self.locked_by_any() {
            return Ok(None);
        }

        let mut state = self.state.lock();

        if state.obsolete.is_some() {
            return Ok(None);
        }

        if let Some(filter) = filter {
            if !filter(&*state) {
                return Ok(None);
            }
        }

        if let Some(swap) = swap {
            if let Some(swap_entry) = SwapEntry::from_state(&self.key, self.partition, &state)? {
                swap.write_all(vec![swap_entry])?;
            }
        }

        let old_value = state.mark_obsolete(obsolete);
        Ok(Some(Evicted { old_value }))
    }

    /// Mark obsolete only if the version still matches `expected`.
    pub(crate) fn mark_obsolete_if_version(&self, expected: &Version, obsolete: Version) -> Option<Evicted> {
        if self.locked_by_any() {
            return None;
        }
        let mut state = self.state.lock();
        if state.obsolete.is_some() || state.version != *expected {
            return None;
        }
        let old_value = state.mark_obsolete(obsolete);
        Some(Evicted { old_value })
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("partition", &self.partition)
            .field("version", &state.version)
            .field("has_value", &state.value.is_some())
            .field("obsolete", &state.obsolete.is_some())
            .finish()
    }
}
