// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests (fuzzing) for eviction primitives.
//!
//! Uses proptest to check ordering and queue invariants under random input,
//! and that decoders of peer and swap data never panic, only return clean
//! errors.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

use datagrid_eviction::cluster::EvictionMessage;
use datagrid_eviction::queue::{capacity_target, MIN_QUEUE_TARGET};
use datagrid_eviction::storage::SwapEntry;
use datagrid_eviction::{CacheEntry, CacheValue, EvictionQueue, Version};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn version_strategy() -> impl Strategy<Value = Version> {
    (any::<i32>(), any::<i64>(), any::<i64>(), any::<i32>(), any::<u8>())
        .prop_map(|(top, time, order, node, dc)| Version::new(top, time, order, node, dc))
}

#[derive(Debug, Clone)]
enum QueueOp {
    Enqueue(usize),
    Remove(usize),
    Drain(usize),
}

fn queue_op_strategy(keys: usize) -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        3 => (0..keys).prop_map(QueueOp::Enqueue),
        1 => (0..keys).prop_map(QueueOp::Remove),
        1 => (0..4usize).prop_map(QueueOp::Drain),
    ]
}

fn entries(n: usize) -> Vec<Arc<CacheEntry>> {
    (0..n)
        .map(|i| {
            Arc::new(CacheEntry::new(
                format!("key-{i}"),
                0,
                Some(CacheValue::Bytes(vec![i as u8])),
                Version::new(1, 1, i as i64, 1, 0),
            ))
        })
        .collect()
}

// =============================================================================
// Version ordering
// =============================================================================

proptest! {
    #[test]
    fn fuzz_version_order_is_total(a in version_strategy(), b in version_strategy()) {
        prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        prop_assert_eq!(a == b, a.cmp(&b).is_eq());
    }

    /// Topology version dominates every other component
    #[test]
    fn fuzz_topology_version_dominates(a in version_strategy(), b in version_strategy()) {
        prop_assume!(a.topology_version != b.topology_version);
        prop_assert_eq!(a.cmp(&b), a.topology_version.cmp(&b.topology_version));
    }

    #[test]
    fn fuzz_version_bytes_survive(v in version_strategy()) {
        let mut buf = Vec::new();
        v.write_to(&mut buf);
        prop_assert_eq!(Version::read_from(&buf), Some(v));
    }
}

// =============================================================================
// Eviction queue invariants
// =============================================================================

proptest! {
    /// Whatever the sequence of operations, an entry is queued at most once,
    /// `len` matches what can be drained, and drain preserves queue order.
    ///
    /// Drained candidates are never released here, so their entries stay
    /// marked as queued until `remove` clears the back-reference.
    #[test]
    fn fuzz_queue_operations(ops in prop::collection::vec(queue_op_strategy(8), 0..200)) {
        let queue = EvictionQueue::new();
        let entries = entries(8);
        let mut model: Vec<usize> = Vec::new();
        let mut held: HashSet<usize> = HashSet::new();

        for op in ops {
            match op {
                QueueOp::Enqueue(i) => {
                    let added = queue.enqueue(&entries[i], None);
                    prop_assert_eq!(added, !model.contains(&i) && !held.contains(&i));
                    if added {
                        model.push(i);
                    }
                }
                QueueOp::Remove(i) => {
                    let removed = queue.remove(&entries[i]);
                    prop_assert_eq!(removed, model.contains(&i));
                    model.retain(|m| *m != i);
                    held.remove(&i);
                }
                QueueOp::Drain(n) => {
                    let drained = queue.drain(n);
                    let expected: Vec<usize> = model.drain(..n.min(model.len())).collect();
                    held.extend(expected.iter().copied());
                    let keys: Vec<String> = drained.iter().map(|c| c.key().clone()).collect();
                    let expected_keys: Vec<String> = expected.iter().map(|i| format!("key-{i}")).collect();
                    prop_assert_eq!(keys, expected_keys);
                    for c in &drained {
                        prop_assert_eq!(c.version, c.entry.version());
                    }
                }
            }
            prop_assert_eq!(queue.len(), model.len());
        }

        let rest = queue.drain(usize::MAX);
        let unique: HashSet<&String> = rest.iter().map(|c| c.key()).collect();
        prop_assert_eq!(unique.len(), rest.len());
        prop_assert!(queue.is_empty());
    }

    #[test]
    fn fuzz_capacity_target_bounds(
        buffer in 0usize..100_000,
        cache_size in 0usize..10_000_000,
        ratio in 0.0f64..100.0,
    ) {
        let target = capacity_target(buffer, cache_size, ratio);
        prop_assert!(target <= buffer);
        prop_assert!(target == buffer || target >= MIN_QUEUE_TARGET);
    }
}

// =============================================================================
// Decoder Fuzz Tests
// =============================================================================

proptest! {
    /// Peer messages should never panic on arbitrary bytes
    #[test]
    fn fuzz_message_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..4096)) {
        let _ = EvictionMessage::from_bytes(&bytes);
    }

    /// Near-miss JSON: right shape, wrong types
    #[test]
    fn fuzz_message_from_mangled_json(batch_id in ".*", rejected in prop::collection::vec(any::<i64>(), 0..8)) {
        let json = serde_json::json!({
            "type": "response",
            "batch_id": batch_id,
            "rejected_keys": rejected,
            "error": "maybe",
        });
        let bytes = serde_json::to_vec(&json).unwrap();
        prop_assert!(EvictionMessage::from_bytes(&bytes).is_err());
    }

    /// Swap records should never panic on arbitrary bytes
    #[test]
    fn fuzz_swap_record_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = SwapEntry::decode("k".into(), 0, &bytes);
    }

    /// Truncating a valid swap record is always detected
    #[test]
    fn fuzz_truncated_swap_record_is_rejected(value in prop::collection::vec(any::<u8>(), 1..256), cut in 1usize..64) {
        let entry = CacheEntry::new("k", 3, Some(CacheValue::Bytes(value)), Version::new(1, 2, 3, 4, 5));
        let record = SwapEntry::from_state(entry.key(), entry.partition(), &entry.snapshot())
            .unwrap()
            .expect("entry has a value");
        let encoded = record.encode();
        let cut = cut.min(encoded.len());
        let truncated = &encoded[..encoded.len() - cut];

        prop_assert!(SwapEntry::decode("k".into(), 3, truncated).is_err());
        prop_assert_eq!(SwapEntry::decode("k".into(), 3, &encoded).unwrap(), record);
    }
}
