// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Eviction coordinator.
//!
//! The [`EvictionCoordinator`] is the per-cache, per-node orchestrator that
//! ties together:
//! - the eviction policy (notified on every access, picks victims)
//! - the eviction queue and batches (synchronized mode)
//! - the remote side of the protocol (serving peers' requests)
//! - the bulk swap path and the primary-partition watcher
//!
//! # Modes
//!
//! ```text
//!                 evict(entry)
//!                      │
//!        sync_any? ────┴──── no ──► evict locally now
//!           │
//!          yes
//!           ▼
//!   EvictionQueue ──► EvictionBatch ──► requests to backups / readers
//!                                            │
//!                          responses ◄───────┘
//!                              │
//!                     evict or re-touch each entry
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → Stopping → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use datagrid_eviction::cluster::{ClusterState, InMemoryTopology, NodeId, TokioTimer};
//! use datagrid_eviction::coordinator::{Collaborators, CoordinatorState, EvictionCoordinator};
//! use datagrid_eviction::policy::FifoPolicy;
//! use datagrid_eviction::storage::LocalCache;
//! use datagrid_eviction::EvictionConfig;
//! # use datagrid_eviction::cluster::{EvictionMessage, Messaging, MessagingError};
//! # struct Loopback;
//! # impl Messaging for Loopback {
//! #     fn send(&self, _: NodeId, _: EvictionMessage) -> Result<(), MessagingError> { Ok(()) }
//! # }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let local = NodeId::random();
//! let cluster = ClusterState::new(64, 1);
//! cluster.join(local);
//!
//! let collaborators = Collaborators::new(
//!     Arc::new(LocalCache::new()),
//!     Arc::new(InMemoryTopology::new(cluster, local)),
//!     Arc::new(Loopback),
//!     Arc::new(TokioTimer::current().expect("runtime")),
//! )
//! .with_policy(Arc::new(FifoPolicy::new(10_000)));
//!
//! let coordinator = EvictionCoordinator::new(EvictionConfig::default(), collaborators).expect("valid config");
//! coordinator.start().await.expect("start");
//! assert_eq!(coordinator.state(), CoordinatorState::Running);
//! coordinator.shutdown().await;
//! # }
//! ```

pub mod batch;
mod api;
mod lifecycle;
mod protocol;
mod swap_evict;
mod types;
mod watcher;

pub use batch::{BatchOutcome, BatchState, CompletionCause, EvictionBatch};
pub use types::{CoordinatorState, EvictionEvent, EvictionStats, FinishedTx};

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::backpressure::{BatchGate, BusyLock};
use crate::cluster::{Messaging, NodeId, PartitionTopology, TimerService, TopologyEvent};
use crate::config::{EvictionConfig, EvictionModes};
use crate::entry::{CacheEntry, EntryPredicate, EntryState};
use crate::error::EvictionError;
use crate::policy::{EvictionFilter, EvictionPolicy, Evictor};
use crate::queue::{capacity_target, EvictionCandidate, EvictionQueue};
use crate::storage::traits::SwapStore;
use crate::storage::LocalCache;
use crate::version::VersionGenerator;

/// Capacity of the eviction event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything the coordinator talks to.
///
/// The four required collaborators go through [`Collaborators::new`]; the
/// optional ones are added with the `with_*` methods.
pub struct Collaborators {
    pub cache: Arc<LocalCache>,
    pub topology: Arc<dyn PartitionTopology>,
    pub messaging: Arc<dyn Messaging>,
    pub timer: Arc<dyn TimerService>,
    pub near_cache: Option<Arc<LocalCache>>,
    pub swap: Option<Arc<dyn SwapStore>>,
    pub policy: Option<Arc<dyn EvictionPolicy>>,
    pub filter: Option<Arc<dyn EvictionFilter>>,
    pub versions: Option<Arc<VersionGenerator>>,
}

impl Collaborators {
    pub fn new(
        cache: Arc<LocalCache>,
        topology: Arc<dyn PartitionTopology>,
        messaging: Arc<dyn Messaging>,
        timer: Arc<dyn TimerService>,
    ) -> Self {
        Self {
            cache,
            topology,
            messaging,
            timer,
            near_cache: None,
            swap: None,
            policy: None,
            filter: None,
            versions: None,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn EvictionFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_swap(mut self, swap: Arc<dyn SwapStore>) -> Self {
        self.swap = Some(swap);
        self
    }

    #[must_use]
    pub fn with_near_cache(mut self, near_cache: Arc<LocalCache>) -> Self {
        self.near_cache = Some(near_cache);
        self
    }

    /// Share a version generator with the owning cache.
    #[must_use]
    pub fn with_versions(mut self, versions: Arc<VersionGenerator>) -> Self {
        self.versions = Some(versions);
        self
    }
}

/// Per-cache eviction coordinator.
///
/// # Thread Safety
///
/// `Send + Sync`; every operation may be called from any thread. The only
/// blocking call is the bounded wait in `touch` when too many batches are
/// in flight.
pub struct EvictionCoordinator {
    pub(super) config: EvictionConfig,
    pub(super) modes: EvictionModes,

    /// Handle to ourselves for callbacks (timers, continuations, watcher)
    pub(super) me: Weak<EvictionCoordinator>,

    pub(super) cache: Arc<LocalCache>,
    pub(super) near_cache: Option<Arc<LocalCache>>,
    pub(super) topology: Arc<dyn PartitionTopology>,
    pub(super) messaging: Arc<dyn Messaging>,
    pub(super) timer: Arc<dyn TimerService>,
    pub(super) swap: Option<Arc<dyn SwapStore>>,
    pub(super) policy: Option<Arc<dyn EvictionPolicy>>,
    pub(super) filter: Option<Arc<dyn EvictionFilter>>,
    pub(super) versions: Arc<VersionGenerator>,

    /// Entries awaiting synchronized eviction
    pub(super) queue: EvictionQueue,

    /// Batches preparing or awaiting responses, by id
    pub(super) batches: DashMap<u64, Arc<EvictionBatch>>,

    /// Batch currently collecting candidates
    pub(super) current_batch: Mutex<Option<Arc<EvictionBatch>>>,

    /// Ceiling on in-flight batches
    pub(super) gate: BatchGate,

    pub(super) busy: BusyLock,
    pub(super) stopping: AtomicBool,
    pub(super) first_evict_warned: AtomicBool,
    pub(super) next_batch_id: AtomicU64,

    pub(super) events: broadcast::Sender<EvictionEvent>,

    /// Primary-partition watcher (only with synchronized eviction and a policy)
    pub(super) watcher_tx: Mutex<Option<mpsc::UnboundedSender<TopologyEvent>>>,
    pub(super) watcher: Mutex<Option<JoinHandle<()>>>,

    pub(super) state: watch::Sender<CoordinatorState>,
    pub(super) state_rx: watch::Receiver<CoordinatorState>,
}

impl EvictionCoordinator {
    /// Build a coordinator in the `Created` state.
    ///
    /// Fails with [`EvictionError::Configuration`] on an invalid mode
    /// combination.
    pub fn new(config: EvictionConfig, collaborators: Collaborators) -> Result<Arc<Self>, EvictionError> {
        let modes = config.validate(collaborators.policy.is_some())?;
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Created);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let gate = BatchGate::new(config.evict_synchronized_concurrency_level.max(1) as usize);

        let versions = collaborators.versions.unwrap_or_else(|| Arc::new(VersionGenerator::new(1, 0)));
        versions.on_topology_changed(collaborators.topology.current_version());

        Ok(Arc::new_cyclic(|me| Self {
            config,
            modes,
            me: me.clone(),
            cache: collaborators.cache,
            near_cache: collaborators.near_cache,
            topology: collaborators.topology,
            messaging: collaborators.messaging,
            timer: collaborators.timer,
            swap: collaborators.swap,
            policy: collaborators.policy,
            filter: collaborators.filter,
            versions,
            queue: EvictionQueue::new(),
            batches: DashMap::new(),
            current_batch: Mutex::new(None),
            gate,
            busy: BusyLock::new(),
            stopping: AtomicBool::new(false),
            first_evict_warned: AtomicBool::new(false),
            next_batch_id: AtomicU64::new(0),
            events,
            watcher_tx: Mutex::new(None),
            watcher: Mutex::new(None),
            state: state_tx,
            state_rx,
        }))
    }

    /// Get current coordinator state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Effective modes resolved from the configuration.
    #[must_use]
    pub fn modes(&self) -> EvictionModes {
        self.modes
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    #[must_use]
    pub fn local_node(&self) -> NodeId {
        self.topology.local_node()
    }

    /// Eviction is synchronized with backups or near readers.
    #[must_use]
    pub fn sync_or_near_sync(&self) -> bool {
        self.modes.sync_any
    }

    /// Entries waiting in the eviction queue.
    #[must_use]
    pub fn evict_queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Batch by id, while it is in flight.
    #[must_use]
    pub fn batch(&self, batch_id: u64) -> Option<Arc<EvictionBatch>> {
        self.batches.get(&batch_id).map(|b| Arc::clone(b.value()))
    }

    #[must_use]
    pub fn in_flight_batch_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.batches.iter().map(|b| *b.key()).collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn stats(&self) -> EvictionStats {
        EvictionStats {
            queue_size: self.queue.len(),
            in_flight_batches: self.gate.in_flight(),
            batches_created: self.next_batch_id.load(Ordering::Acquire),
            first_evict_warned: self.first_evict_warned.load(Ordering::Acquire),
        }
    }

    /// Subscribe to eviction events from this node.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EvictionEvent> {
        self.events.subscribe()
    }

    pub(super) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Current queue capacity target.
    pub(super) fn queue_target(&self) -> usize {
        capacity_target(
            self.config.evict_synchronized_key_buffer_size.max(0) as usize,
            self.cache.len(),
            self.config.evict_max_overflow_ratio,
        )
    }

    pub(super) fn new_batch(&self) -> Arc<EvictionBatch> {
        let id = self.next_batch_id.fetch_add(1, Ordering::AcqRel) + 1;
        Arc::new(EvictionBatch::new(id, Arc::clone(&self.timer)))
    }

    /// Entry still carries the version seen at enqueue, and passes the
    /// caller's own filter if one was given.
    pub(super) fn version_filter(candidate: &EvictionCandidate) -> EntryPredicate {
        let expected = candidate.version;
        let inner = candidate.filter.clone();
        Arc::new(move |state: &EntryState| *state.version() == expected && inner.as_ref().map_or(true, |f| f(state)))
    }
}

impl Evictor for EvictionCoordinator {
    fn evict(&self, entry: &Arc<CacheEntry>) -> bool {
        EvictionCoordinator::evict(self, entry, None, false, None)
    }
}

impl std::fmt::Debug for EvictionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionCoordinator")
            .field("cache", &self.config.cache_name)
            .field("state", &self.state())
            .field("modes", &self.modes)
            .field("stats", &self.stats())
            .finish()
    }
}
