// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entry versions.
//!
//! A [`Version`] totally orders writes across the grid. The eviction protocol
//! uses it for conflict detection: a candidate is only removed while its
//! version still equals the one captured when it was queued.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonically increasing partition-to-node assignment counter.
pub type TopologyVersion = i64;

/// Immutable entry version.
///
/// Ordered by `topology_version`, then `global_time`, then `order`, then
/// `node_order`. `data_center_id` only breaks ties left after those four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub topology_version: i32,
    pub global_time: i64,
    pub order: i64,
    pub node_order: i32,
    pub data_center_id: u8,
}

/// Serialized width of a [`Version`].
pub const VERSION_BYTES: usize = 4 + 8 + 8 + 4 + 1;

impl Version {
    pub fn new(topology_version: i32, global_time: i64, order: i64, node_order: i32, data_center_id: u8) -> Self {
        Self { topology_version, global_time, order, node_order, data_center_id }
    }

    /// Compare ignoring the data center id.
    #[must_use]
    pub fn cmp_local(&self, other: &Self) -> Ordering {
        self.topology_version
            .cmp(&other.topology_version)
            .then(self.global_time.cmp(&other.global_time))
            .then(self.order.cmp(&other.order))
            .then(self.node_order.cmp(&other.node_order))
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.topology_version.to_le_bytes());
        buf.extend_from_slice(&self.global_time.to_le_bytes());
        buf.extend_from_slice(&self.order.to_le_bytes());
        buf.extend_from_slice(&self.node_order.to_le_bytes());
        buf.push(self.data_center_id);
    }

    /// Read a version from the front of `buf`.
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < VERSION_BYTES {
            return None;
        }
        Some(Self {
            topology_version: i32::from_le_bytes(buf[0..4].try_into().ok()?),
            global_time: i64::from_le_bytes(buf[4..12].try_into().ok()?),
            order: i64::from_le_bytes(buf[12..20].try_into().ok()?),
            node_order: i32::from_le_bytes(buf[20..24].try_into().ok()?),
            data_center_id: buf[24],
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_local(other).then(self.data_center_id.cmp(&other.data_center_id))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ver[top={}, time={}, order={}, node={}, dc={}]",
            self.topology_version, self.global_time, self.order, self.node_order, self.data_center_id
        )
    }
}

/// Issues fresh versions for this node (used as obsolete versions on eviction).
#[derive(Debug)]
pub struct VersionGenerator {
    node_order: i32,
    data_center_id: u8,
    order: AtomicI64,
    topology_version: AtomicI64,
}

impl VersionGenerator {
    pub fn new(node_order: i32, data_center_id: u8) -> Self {
        Self {
            node_order,
            data_center_id,
            order: AtomicI64::new(0),
            topology_version: AtomicI64::new(0),
        }
    }

    /// Track the latest topology version seen by this node.
    pub fn on_topology_changed(&self, topology_version: TopologyVersion) {
        self.topology_version.fetch_max(topology_version, AtomicOrdering::AcqRel);
    }

    /// Next version; strictly greater than every version previously issued here.
    pub fn next(&self) -> Version {
        let order = self.order.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        let global_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Version {
            topology_version: self.topology_version.load(AtomicOrdering::Acquire) as i32,
            global_time,
            order,
            node_order: self.node_order,
            data_center_id: self.data_center_id,
        }
    }
}
