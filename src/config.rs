// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the eviction subsystem.
//!
//! The configuration itself is owned by the embedding cache; this module only
//! describes the surface the eviction coordinator consumes and validates it.
//!
//! # Example
//!
//! ```
//! use datagrid_eviction::{EvictionConfig, CacheMode};
//!
//! // Defaults: partitioned, unsynchronized evictions
//! let config = EvictionConfig::default();
//! assert_eq!(config.evict_synchronized_key_buffer_size, 1024);
//!
//! // Synchronized evictions with backups
//! let config = EvictionConfig {
//!     cache_mode: CacheMode::Partitioned,
//!     evict_synchronized: true,
//!     evict_synchronized_timeout_ms: 5_000,
//!     ..Default::default()
//! };
//! let modes = config.validate(true).expect("valid config");
//! assert!(modes.evict_sync);
//! ```

use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::error::EvictionError;

/// Cache distribution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Single node, no backups and no readers.
    Local,
    /// Partitioned across nodes with backups.
    Partitioned,
    /// Every node holds every partition.
    Replicated,
}

/// Where entry values live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Entries on heap, evicted entries optionally swapped out.
    OnheapTiered,
    /// Entries live off-heap; on-heap copies are dropped right after access.
    OffheapTiered,
    /// Entry shells on heap, values off-heap.
    OffheapValues,
}

/// Configuration surface consumed by the eviction coordinator.
#[derive(Debug, Clone, Deserialize)]
pub struct EvictionConfig {
    /// Cache name (used in log messages)
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    #[serde(default = "default_cache_mode")]
    pub cache_mode: CacheMode,

    #[serde(default = "default_memory_mode")]
    pub memory_mode: MemoryMode,

    /// Near caches are enabled on other nodes for this cache
    #[serde(default)]
    pub near_enabled: bool,

    /// Swap space is enabled for evicted entries
    #[serde(default)]
    pub swap_enabled: bool,

    /// Preloading (rebalancing) is enabled
    #[serde(default = "default_preload_enabled")]
    pub preload_enabled: bool,

    /// Evictions on primary must be confirmed by backups
    #[serde(default)]
    pub evict_synchronized: bool,

    /// Evictions on primary must be confirmed by near-cache readers
    #[serde(default)]
    pub evict_near_synchronized: bool,

    /// Queue overflow ratio, percent of cache size (>= 0)
    #[serde(default = "default_evict_max_overflow_ratio")]
    pub evict_max_overflow_ratio: f64,

    /// Upper bound on keys per synchronized batch (>= 0)
    #[serde(default = "default_evict_synchronized_key_buffer_size")]
    pub evict_synchronized_key_buffer_size: i32,

    /// Batch timeout in milliseconds (> 0 when synchronized)
    #[serde(default = "default_evict_synchronized_timeout_ms")]
    pub evict_synchronized_timeout_ms: i64,

    /// Max in-flight batches before `touch` blocks (> 0 when synchronized)
    #[serde(default = "default_evict_synchronized_concurrency_level")]
    pub evict_synchronized_concurrency_level: i32,

    /// Periodic wake-up of threads blocked on the in-flight ceiling
    #[serde(default = "default_backpressure_wait_ms")]
    pub backpressure_wait_ms: u64,
}

fn default_cache_name() -> String { "default".to_string() }
fn default_cache_mode() -> CacheMode { CacheMode::Partitioned }
fn default_memory_mode() -> MemoryMode { MemoryMode::OnheapTiered }
fn default_preload_enabled() -> bool { true }
fn default_evict_max_overflow_ratio() -> f64 { 10.0 }
fn default_evict_synchronized_key_buffer_size() -> i32 { 1024 }
fn default_evict_synchronized_timeout_ms() -> i64 { 10_000 }
fn default_evict_synchronized_concurrency_level() -> i32 { 4 }
fn default_backpressure_wait_ms() -> u64 { 2_000 }

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            cache_name: default_cache_name(),
            cache_mode: default_cache_mode(),
            memory_mode: default_memory_mode(),
            near_enabled: false,
            swap_enabled: false,
            preload_enabled: default_preload_enabled(),
            evict_synchronized: false,
            evict_near_synchronized: false,
            evict_max_overflow_ratio: default_evict_max_overflow_ratio(),
            evict_synchronized_key_buffer_size: default_evict_synchronized_key_buffer_size(),
            evict_synchronized_timeout_ms: default_evict_synchronized_timeout_ms(),
            evict_synchronized_concurrency_level: default_evict_synchronized_concurrency_level(),
            backpressure_wait_ms: default_backpressure_wait_ms(),
        }
    }
}

/// Effective eviction modes after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionModes {
    /// Backups confirm evictions
    pub evict_sync: bool,
    /// Near readers confirm evictions
    pub near_sync: bool,
    /// `evict_sync || near_sync`
    pub sync_any: bool,
    /// Policy is notified on access
    pub policy_enabled: bool,
    /// Evicted entries are written to swap / off-heap
    pub swap_or_offheap: bool,
    pub memory_mode: MemoryMode,
}

impl EvictionConfig {
    /// Swap or off-heap storage is in play.
    #[must_use]
    pub fn is_swap_or_offheap_enabled(&self) -> bool {
        self.swap_enabled || self.memory_mode != MemoryMode::OnheapTiered
    }

    /// Batch timeout as a [`Duration`].
    #[must_use]
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.evict_synchronized_timeout_ms.max(0) as u64)
    }

    /// Resolve effective modes, rejecting invalid combinations.
    ///
    /// `has_policy` tells whether an eviction policy is installed.
    pub fn validate(&self, has_policy: bool) -> Result<EvictionModes, EvictionError> {
        if self.evict_max_overflow_ratio < 0.0 {
            return Err(EvictionError::Configuration(
                "'evict_max_overflow_ratio' cannot be negative".into(),
            ));
        }

        if self.evict_synchronized_key_buffer_size < 0 {
            return Err(EvictionError::Configuration(
                "'evict_synchronized_key_buffer_size' cannot be negative".into(),
            ));
        }

        let swap_or_offheap = self.is_swap_or_offheap_enabled();

        let (evict_sync, near_sync) = if self.cache_mode == CacheMode::Local {
            if self.evict_synchronized {
                warn!(cache = %self.cache_name, "Ignored 'evict_synchronized' for LOCAL cache");
            }
            if self.evict_near_synchronized {
                warn!(cache = %self.cache_name, "Ignored 'evict_near_synchronized' for LOCAL cache");
            }
            (false, false)
        } else {
            (
                self.evict_synchronized && !swap_or_offheap,
                self.evict_near_synchronized && self.near_enabled,
            )
        };

        if evict_sync && !near_sync && self.near_enabled {
            return Err(EvictionError::Configuration(
                "evict_synchronized=true with evict_near_synchronized=false may lead to data inconsistency".into(),
            ));
        }

        let sync_any = evict_sync || near_sync;

        if sync_any {
            if self.evict_synchronized_timeout_ms <= 0 {
                return Err(EvictionError::Configuration(
                    "'evict_synchronized_timeout_ms' should be positive".into(),
                ));
            }
            if self.evict_synchronized_concurrency_level <= 0 {
                return Err(EvictionError::Configuration(
                    "'evict_synchronized_concurrency_level' should be positive".into(),
                ));
            }
        }

        let policy_enabled = has_policy && self.memory_mode != MemoryMode::OffheapTiered;

        let modes = EvictionModes {
            evict_sync,
            near_sync,
            sync_any,
            policy_enabled,
            swap_or_offheap,
            memory_mode: self.memory_mode,
        };

        self.report_problems(&modes);

        Ok(modes)
    }

    fn report_problems(&self, modes: &EvictionModes) {
        if !modes.policy_enabled || self.cache_mode != CacheMode::Partitioned {
            return;
        }

        if !modes.evict_sync {
            warn!(
                cache = %self.cache_name,
                "Evictions are not synchronized with other nodes; data may become inconsistent \
                 if no cache store is configured (consider 'evict_synchronized')"
            );
        }

        if !modes.near_sync && self.near_enabled {
            warn!(
                cache = %self.cache_name,
                "Evictions on primary are not synchronized with near caches on other nodes \
                 (consider 'evict_near_synchronized')"
            );
        }
    }
}
