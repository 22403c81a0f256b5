// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Datagrid Eviction
//!
//! Distributed eviction coordination for one node of a partitioned,
//! replicated in-memory data grid.
//!
//! ## Architecture
//!
//! Every cache on every node has one [`EvictionCoordinator`]. In the
//! simplest mode it evicts locally whatever its policy gives up. With
//! synchronized eviction the primary makes sure backups (and near-cache
//! readers) drop an entry at the same version before it drops it itself:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Cache operations                        │
//! │  • touch / touch_tx on every access                        │
//! │  • evict on explicit request                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Eviction policy                          │
//! │  • Ranks entries, picks victims                            │
//! │  • Asks the coordinator to evict them                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                 (Synchronized: queue, then batch)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Eviction batches                         │
//! │  • One request per backup / reader node                    │
//! │  • Peers evict at the same version or reject               │
//! │  • Timeout, node departure and error handling              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Local cache / swap store                    │
//! │  • Entries marked obsolete and removed                     │
//! │  • Values optionally written to swap first                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Synchronized eviction**: backups and near readers confirm before the
//!   primary evicts, so replicas never diverge
//! - **Batching**: queued evictions are grouped into batches, with a ceiling
//!   on in-flight batches
//! - **Version safety**: an entry updated after being queued is never evicted
//!   by that batch
//! - **Swap**: bulk eviction to a swap store in one write
//! - **Rebalancing aware**: entries of newly primary partitions are handed to
//!   the policy
//!
//! ## Configuration
//!
//! See [`EvictionConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`EvictionCoordinator`] and its batch protocol
//! - [`policy`]: Policy and filter traits, plus a FIFO policy
//! - [`queue`]: Eviction queue for synchronized mode
//! - [`cluster`]: Node identity, topology, messaging and timers
//! - [`storage`]: Local cache map and swap store
//! - [`backpressure`]: Batch ceiling and shutdown gating

pub mod backpressure;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod storage;
pub mod version;

pub use config::{CacheMode, EvictionConfig, EvictionModes, MemoryMode};
pub use coordinator::{
    BatchOutcome, Collaborators, CompletionCause, CoordinatorState, EvictionCoordinator, EvictionEvent,
    EvictionStats, FinishedTx,
};
pub use entry::{CacheEntry, CacheKey, CacheValue, EntryPredicate, EntryState, PartitionId};
pub use error::EvictionError;
pub use policy::{EvictionFilter, EvictionPolicy, Evictor, FifoPolicy, PolicyEntry};
pub use queue::{EvictionCandidate, EvictionQueue};
pub use storage::{LocalCache, MemorySwapStore, SwapStore};
pub use version::{TopologyVersion, Version, VersionGenerator};
