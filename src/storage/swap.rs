// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Swap records for entries evicted to secondary storage.
//!
//! # Record layout (little endian)
//!
//! ```text
//! ┌──────────┬──────────────┬───────────────┬──────────┬────────────────────────────┐
//! │ ttl: i64 │ expire: i64  │ version (25B) │ flags:u8 │ payload                    │
//! └──────────┴──────────────┴───────────────┴──────────┴────────────────────────────┘
//! flags bit 0: value is a byte array
//! flags bit 1: payload is an off-heap pointer (address: u64, len: u32)
//!              otherwise payload is len: u32 followed by the value bytes
//! ```

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::traits::{SwapError, SwapStore};
use crate::entry::{CacheKey, CacheValue, EntryState, PartitionId};
use crate::version::{Version, VERSION_BYTES};

const FLAG_BYTE_ARRAY: u8 = 0b01;
const FLAG_OFFHEAP: u8 = 0b10;
const HEADER_BYTES: usize = 8 + 8 + VERSION_BYTES + 1;

/// Swapped value payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapValue {
    Bytes(Vec<u8>),
    OffHeap { address: u64, len: u32 },
}

/// An entry serialized for secondary storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapEntry {
    pub key: CacheKey,
    pub partition: PartitionId,
    pub ttl: i64,
    pub expire_time: i64,
    pub version: Version,
    pub value_is_byte_array: bool,
    pub value: SwapValue,
}

impl SwapEntry {
    /// Build a swap record from locked entry state. `Ok(None)` if there is nothing to swap.
    pub fn from_state(key: &CacheKey, partition: PartitionId, state: &EntryState) -> Result<Option<Self>, SwapError> {
        if state.is_obsolete() {
            return Ok(None);
        }
        let Some(value) = state.value() else {
            return Ok(None);
        };
        let (value_is_byte_array, value) = match value {
            CacheValue::Bytes(bytes) => (true, SwapValue::Bytes(bytes.clone())),
            CacheValue::Json(json) => {
                let bytes = serde_json::to_vec(json).map_err(|e| SwapError::Encode(format!("{key}: {e}")))?;
                (false, SwapValue::Bytes(bytes))
            }
            CacheValue::OffHeap { address, len } => (true, SwapValue::OffHeap { address: *address, len: *len }),
        };
        Ok(Some(Self {
            key: key.clone(),
            partition,
            ttl: state.ttl(),
            expire_time: state.expire_time(),
            version: *state.version(),
            value_is_byte_array,
            value,
        }))
    }

    /// Encode the record body (key and partition are stored by the swap index).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = match &self.value {
            SwapValue::Bytes(b) => 4 + b.len(),
            SwapValue::OffHeap { .. } => 12,
        };
        let mut buf = Vec::with_capacity(HEADER_BYTES + payload_len);
        buf.extend_from_slice(&self.ttl.to_le_bytes());
        buf.extend_from_slice(&self.expire_time.to_le_bytes());
        self.version.write_to(&mut buf);

        let mut flags = 0u8;
        if self.value_is_byte_array {
            flags |= FLAG_BYTE_ARRAY;
        }
        match &self.value {
            SwapValue::Bytes(bytes) => {
                buf.push(flags);
                buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                buf.extend_from_slice(bytes);
            }
            SwapValue::OffHeap { address, len } => {
                buf.push(flags | FLAG_OFFHEAP);
                buf.extend_from_slice(&address.to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
            }
        }
        buf
    }

    /// Decode a record body produced by [`encode`](Self::encode).
    pub fn decode(key: CacheKey, partition: PartitionId, buf: &[u8]) -> Result<Self, SwapError> {
        if buf.len() < HEADER_BYTES {
            return Err(SwapError::Corrupted(format!("record too short: {} bytes", buf.len())));
        }
        let ttl = i64::from_le_bytes(read_array(buf, 0)?);
        let expire_time = i64::from_le_bytes(read_array(buf, 8)?);
        let version = Version::read_from(&buf[16..])
            .ok_or_else(|| SwapError::Corrupted("truncated version".into()))?;
        let flags = buf[16 + VERSION_BYTES];
        let payload = &buf[HEADER_BYTES..];

        let value = if flags & FLAG_OFFHEAP != 0 {
            SwapValue::OffHeap {
                address: u64::from_le_bytes(read_array(payload, 0)?),
                len: u32::from_le_bytes(read_array(payload, 8)?),
            }
        } else {
            let len = u32::from_le_bytes(read_array(payload, 0)?) as usize;
            let bytes = payload
                .get(4..4 + len)
                .ok_or_else(|| SwapError::Corrupted(format!("value truncated, expected {} bytes", len)))?;
            SwapValue::Bytes(bytes.to_vec())
        };

        Ok(Self {
            key,
            partition,
            ttl,
            expire_time,
            version,
            value_is_byte_array: flags & FLAG_BYTE_ARRAY != 0,
            value,
        })
    }
}

fn read_array<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N], SwapError> {
    buf.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| SwapError::Corrupted(format!("truncated field at offset {}", at)))
}

/// Swap space kept in memory, keyed by entry key.
pub struct MemorySwapStore {
    records: DashMap<CacheKey, (PartitionId, Vec<u8>)>,
    writes: AtomicU64,
    fail: AtomicBool,
}

impl MemorySwapStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            writes: AtomicU64::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Make subsequent writes fail (failure injection).
    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Number of `write_all` calls that succeeded.
    pub fn write_calls(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Read a record back.
    pub fn read(&self, key: &str) -> Option<Result<SwapEntry, SwapError>> {
        self.records
            .get(key)
            .map(|r| SwapEntry::decode(key.to_string(), r.0, &r.1))
    }
}

impl Default for MemorySwapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapStore for MemorySwapStore {
    fn write_all(&self, batch: Vec<SwapEntry>) -> Result<(), SwapError> {
        if self.fail.load(Ordering::Acquire) {
            return Err(SwapError::Write("injected failure".into()));
        }
        for entry in batch {
            let body = entry.encode();
            self.records.insert(entry.key, (entry.partition, body));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CacheEntry;
    use serde_json::json;

    fn version() -> Version {
        Version::new(3, 1_000, 7, 2, 1)
    }

    #[test]
    fn test_bytes_record_decodes() {
        let entry = CacheEntry::new("k", 4, Some(CacheValue::Bytes(vec![1, 2, 3])), version());
        entry.set_ttl(500, 9_000);
        let record = SwapEntry::from_state(entry.key(), entry.partition(), &entry.snapshot()).unwrap().unwrap();
        assert!(record.value_is_byte_array);

        let decoded = SwapEntry::decode("k".into(), 4, &record.encode()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.ttl, 500);
        assert_eq!(decoded.expire_time, 9_000);
    }

    #[test]
    fn test_json_value_is_not_byte_array() {
        let entry = CacheEntry::new("k", 0, Some(CacheValue::Json(json!({"a": 1}))), version());
        let record = SwapEntry::from_state(entry.key(), 0, &entry.snapshot()).unwrap().unwrap();
        assert!(!record.value_is_byte_array);
        let SwapValue::Bytes(bytes) = &record.value else { panic!("expected inline bytes") };
        let back: serde_json::Value = serde_json::from_slice(bytes).unwrap();
        assert_eq!(back["a"], 1);
    }

    #[test]
    fn test_offheap_pointer_layout() {
        let entry = CacheEntry::new("k", 0, Some(CacheValue::OffHeap { address: 0xdead_beef, len: 64 }), version());
        let record = SwapEntry::from_state(entry.key(), 0, &entry.snapshot()).unwrap().unwrap();
        let body = record.encode();
        assert_eq!(body.len(), HEADER_BYTES + 12);
        let decoded = SwapEntry::decode("k".into(), 0, &body).unwrap();
        assert_eq!(decoded.value, SwapValue::OffHeap { address: 0xdead_beef, len: 64 });
    }

    #[test]
    fn test_empty_entry_has_no_record() {
        let entry = CacheEntry::new("k", 0, None, version());
        assert!(SwapEntry::from_state(entry.key(), 0, &entry.snapshot()).unwrap().is_none());
    }

    #[test]
    fn test_truncated_record_is_corrupted() {
        let entry = CacheEntry::new("k", 0, Some(CacheValue::Bytes(vec![9; 32])), version());
        let body = SwapEntry::from_state(entry.key(), 0, &entry.snapshot()).unwrap().unwrap().encode();
        assert!(matches!(
            SwapEntry::decode("k".into(), 0, &body[..body.len() - 1]),
            Err(SwapError::Corrupted(_))
        ));
        assert!(SwapEntry::decode("k".into(), 0, &body[..5]).is_err());
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let store = MemorySwapStore::new();
        let entry = CacheEntry::new("k", 0, Some(CacheValue::Bytes(vec![1])), version());
        let record = SwapEntry::from_state(entry.key(), 0, &entry.snapshot()).unwrap().unwrap();

        store.fail_writes(true);
        assert!(store.write_all(vec![record.clone()]).is_err());
        assert!(store.is_empty());

        store.fail_writes(false);
        store.write_all(vec![record]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.write_calls(), 1);
        assert!(store.read("k").unwrap().is_ok());
    }
}
