// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process grid used by the integration and chaos tests.
//!
//! Messages are queued on a shared [`Bus`] and delivered only when a test
//! calls [`Bus::pump`], so every interleaving is explicit. Timeouts fire only
//! when a test calls [`ManualTimer::fire_all`].

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use datagrid_eviction::cluster::timer::TimerCallback;
use datagrid_eviction::cluster::{
    ClusterState, EvictionMessage, InMemoryTopology, Messaging, MessagingError, NodeId, PartitionTopology,
    TimerHandle, TimerService, TopologyEvent,
};
use datagrid_eviction::{
    CacheEntry, CacheValue, Collaborators, EvictionConfig, EvictionCoordinator, FifoPolicy, LocalCache,
    MemorySwapStore, Version, VersionGenerator,
};

// =============================================================================
// Messaging
// =============================================================================

struct Envelope {
    from: NodeId,
    to: NodeId,
    message: EvictionMessage,
}

/// Shared message queue between in-process nodes.
pub struct Bus {
    cluster: Arc<ClusterState>,
    queue: Mutex<VecDeque<Envelope>>,
    nodes: Mutex<HashMap<NodeId, Weak<EvictionCoordinator>>>,
    broken: Mutex<HashSet<NodeId>>,
    undecodable: Mutex<HashSet<NodeId>>,
}

impl Bus {
    pub fn new(cluster: Arc<ClusterState>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            queue: Mutex::new(VecDeque::new()),
            nodes: Mutex::new(HashMap::new()),
            broken: Mutex::new(HashSet::new()),
            undecodable: Mutex::new(HashSet::new()),
        })
    }

    pub fn register(&self, node: NodeId, coordinator: &Arc<EvictionCoordinator>) {
        self.nodes.lock().insert(node, Arc::downgrade(coordinator));
    }

    /// Sends to `node` fail with a transport error.
    pub fn break_link(&self, node: NodeId) {
        self.broken.lock().insert(node);
    }

    /// Requests delivered to `node` arrive as undecodable.
    pub fn corrupt_requests_to(&self, node: NodeId) {
        self.undecodable.lock().insert(node);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drop everything in flight.
    pub fn discard(&self) -> usize {
        let mut queue = self.queue.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    /// Take queued messages without delivering them.
    pub fn take(&self) -> Vec<(NodeId, NodeId, EvictionMessage)> {
        self.queue.lock().drain(..).map(|e| (e.from, e.to, e.message)).collect()
    }

    /// Deliver until the queue is empty. Returns the number delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.queue.lock().pop_front();
            let Some(Envelope { from, to, mut message }) = next else {
                return delivered;
            };

            if let EvictionMessage::Request(request) = &mut message {
                if self.undecodable.lock().contains(&to) {
                    request.class_error = Some("unknown value class".into());
                }
            }

            let target = self.nodes.lock().get(&to).and_then(Weak::upgrade);
            if let Some(coordinator) = target {
                coordinator.on_message(from, message);
                delivered += 1;
            }
        }
    }

    fn send(&self, from: NodeId, to: NodeId, message: EvictionMessage) -> Result<(), MessagingError> {
        if !self.cluster.nodes().contains(&to) {
            return Err(MessagingError::NodeLeft(to));
        }
        if self.broken.lock().contains(&to) {
            return Err(MessagingError::Transport(format!("connection to {to} refused")));
        }
        // Go through the wire format like a real transport would
        let message = EvictionMessage::from_bytes(&message.to_bytes()?)?;
        self.queue.lock().push_back(Envelope { from, to, message });
        Ok(())
    }
}

/// One node's handle on the bus.
pub struct Endpoint {
    local: NodeId,
    bus: Arc<Bus>,
}

impl Endpoint {
    /// An endpoint on a bus nobody else is attached to.
    pub fn detached(local: NodeId) -> Self {
        Self { local, bus: Bus::new(ClusterState::new(1, 0)) }
    }
}

impl Messaging for Endpoint {
    fn send(&self, to: NodeId, message: EvictionMessage) -> Result<(), MessagingError> {
        self.bus.send(self.local, to, message)
    }
}

// =============================================================================
// Timers
// =============================================================================

/// Timer that only fires when told to.
#[derive(Default)]
pub struct ManualTimer {
    pending: Mutex<HashMap<u64, (Duration, TimerCallback)>>,
    next: AtomicU64,
}

impl ManualTimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn armed(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.pending.lock().values().map(|(d, _)| *d).collect()
    }

    pub fn fire_all(&self) -> usize {
        let callbacks: Vec<_> = self.pending.lock().drain().map(|(_, (_, cb))| cb).collect();
        let n = callbacks.len();
        for cb in callbacks {
            cb();
        }
        n
    }
}

impl TimerService for ManualTimer {
    fn schedule(&self, after: Duration, callback: TimerCallback) -> TimerHandle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(id, (after, callback));
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        self.pending.lock().remove(&handle.0).is_some()
    }
}

// =============================================================================
// Grid
// =============================================================================

pub struct Node {
    pub id: NodeId,
    pub cache: Arc<LocalCache>,
    pub near_cache: Arc<LocalCache>,
    pub topology: Arc<InMemoryTopology>,
    pub policy: Arc<FifoPolicy>,
    pub coordinator: Arc<EvictionCoordinator>,
}

pub struct Grid {
    pub cluster: Arc<ClusterState>,
    pub bus: Arc<Bus>,
    pub timer: Arc<ManualTimer>,
    pub nodes: Vec<Node>,
    versions: VersionGenerator,
}

impl Grid {
    /// `size` nodes sharing one cluster, each with a FIFO policy of
    /// `policy_max` entries.
    pub fn new(size: usize, partitions: u32, backups: usize, config: EvictionConfig, policy_max: usize) -> Self {
        let cluster = ClusterState::new(partitions, backups);
        let ids: Vec<NodeId> = (0..size).map(|_| NodeId::random()).collect();
        for id in &ids {
            cluster.join(*id);
        }

        let bus = Bus::new(Arc::clone(&cluster));
        let timer = ManualTimer::new();

        let nodes = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let cache = Arc::new(LocalCache::new());
                let near_cache = Arc::new(LocalCache::new());
                let topology = Arc::new(InMemoryTopology::new(Arc::clone(&cluster), *id));
                let policy = Arc::new(FifoPolicy::new(policy_max));
                let collaborators = Collaborators::new(
                    Arc::clone(&cache),
                    Arc::clone(&topology) as Arc<dyn PartitionTopology>,
                    Arc::new(Endpoint { local: *id, bus: Arc::clone(&bus) }),
                    Arc::clone(&timer) as Arc<dyn TimerService>,
                )
                .with_policy(Arc::clone(&policy) as _)
                .with_near_cache(Arc::clone(&near_cache))
                .with_versions(Arc::new(VersionGenerator::new(i as i32 + 1, 0)));

                let coordinator = EvictionCoordinator::new(config.clone(), collaborators).expect("valid config");
                bus.register(*id, &coordinator);
                Node { id: *id, cache, near_cache, topology, policy, coordinator }
            })
            .collect();

        Self {
            cluster,
            bus,
            timer,
            nodes,
            versions: VersionGenerator::new(1000, 0),
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.iter().find(|n| n.id == id).expect("known node")
    }

    pub fn partition(&self, key: &str) -> u32 {
        self.nodes[0].topology.partition(key)
    }

    /// Owners of `key`, primary first.
    pub fn owners(&self, key: &str) -> Vec<&Node> {
        let p = self.partition(key);
        self.nodes[0]
            .topology
            .nodes_owning(p, self.cluster.version())
            .into_iter()
            .map(|id| self.node(id))
            .collect()
    }

    pub fn primary(&self, key: &str) -> &Node {
        self.owners(key)[0]
    }

    /// Write `key` on every owner with one shared version.
    pub fn put(&self, key: &str, value: &[u8]) -> Version {
        let version = self.versions.next();
        let p = self.partition(key);
        for node in self.owners(key) {
            node.cache.put(key, p, CacheValue::Bytes(value.to_vec()), version);
        }
        version
    }

    /// Write `key` on one node only.
    pub fn put_on(&self, node: &Node, key: &str, value: &[u8]) -> Arc<CacheEntry> {
        let version = self.versions.next();
        node.cache.put(key, self.partition(key), CacheValue::Bytes(value.to_vec()), version)
    }

    /// Take `id` out of the cluster and tell everyone else.
    pub fn leave(&self, id: NodeId) {
        self.cluster.leave(id);
        for node in self.nodes.iter().filter(|n| n.id != id) {
            node.coordinator.on_topology_event(TopologyEvent::NodeLeft(id));
        }
    }
}

/// A lone node with a swap store attached.
pub struct Single {
    pub id: NodeId,
    pub cache: Arc<LocalCache>,
    pub policy: Arc<FifoPolicy>,
    pub swap: Arc<MemorySwapStore>,
    pub coordinator: Arc<EvictionCoordinator>,
    versions: VersionGenerator,
}

impl Single {
    pub fn new(config: EvictionConfig, policy_max: usize) -> Self {
        Self::with(config, policy_max, |c| c)
    }

    /// Like [`Single::new`], letting the caller add collaborators.
    pub fn with(config: EvictionConfig, policy_max: usize, customize: impl FnOnce(Collaborators) -> Collaborators) -> Self {
        let id = NodeId::random();
        let cluster = ClusterState::new(8, 0);
        cluster.join(id);

        let bus = Bus::new(Arc::clone(&cluster));
        let cache = Arc::new(LocalCache::new());
        let policy = Arc::new(FifoPolicy::new(policy_max));
        let swap = Arc::new(MemorySwapStore::new());

        let collaborators = Collaborators::new(
            Arc::clone(&cache),
            Arc::new(InMemoryTopology::new(cluster, id)),
            Arc::new(Endpoint { local: id, bus: Arc::clone(&bus) }),
            ManualTimer::new(),
        )
        .with_policy(Arc::clone(&policy) as _)
        .with_swap(Arc::clone(&swap) as _);

        let coordinator = EvictionCoordinator::new(config, customize(collaborators)).expect("valid config");
        bus.register(id, &coordinator);

        Self { id, cache, policy, swap, coordinator, versions: VersionGenerator::new(1000, 0) }
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Arc<CacheEntry> {
        self.cache.put(key, 0, CacheValue::Bytes(value.to_vec()), self.versions.next())
    }
}

/// Local cache, no synchronization.
pub fn local_config() -> EvictionConfig {
    EvictionConfig {
        cache_mode: datagrid_eviction::CacheMode::Local,
        ..Default::default()
    }
}

/// Synchronized eviction with batches of one entry.
pub fn sync_config() -> EvictionConfig {
    EvictionConfig {
        evict_synchronized: true,
        evict_synchronized_key_buffer_size: 1,
        evict_synchronized_timeout_ms: 10_000,
        evict_synchronized_concurrency_level: 4,
        backpressure_wait_ms: 20,
        ..Default::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
