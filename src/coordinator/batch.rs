// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One round of the synchronized eviction protocol.
//!
//! ```text
//! Collecting ──► Preparing ──► AwaitingResponses ──► Done
//!      │              │                                ▲
//!      └──────────────┴──── cancel / empty ────────────┘
//! ```
//!
//! - **Collecting**: candidates are added while the batch sits in the
//!   coordinator's current-batch slot.
//! - **Preparing**: exactly one thread resolves participants and sends
//!   requests. Responses and departures arriving now are recorded, but
//!   completion is not evaluated until preparation finishes.
//! - **AwaitingResponses**: every response or departure re-checks whether
//!   all expected responses are in.
//! - **Done**: reached exactly once through a CAS. Whoever wins builds the
//!   outcome and runs the continuations; every other attempt is a no-op.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cluster::messaging::{EvictionRequest, EvictionResponse};
use crate::cluster::timer::{TimerHandle, TimerService};
use crate::cluster::NodeId;
use crate::entry::CacheKey;
use crate::error::EvictionError;
use crate::metrics::{self, BatchTimer};
use crate::queue::EvictionCandidate;
use crate::version::TopologyVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchState {
    Collecting = 0,
    Preparing = 1,
    AwaitingResponses = 2,
    Done = 3,
}

impl BatchState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Collecting,
            1 => Self::Preparing,
            2 => Self::AwaitingResponses,
            _ => Self::Done,
        }
    }
}

/// Why a batch reached `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCause {
    /// Every participant answered (or left)
    Responses,
    /// A participant could not process the request at all
    NodeError,
    TimedOut,
    Cancelled,
    /// Nothing needed remote confirmation
    Empty,
}

impl CompletionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Responses => "responses",
            Self::NodeError => "node_error",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Empty => "empty",
        }
    }

    /// Outcomes in which nothing may be evicted.
    pub fn rejects_all(&self) -> bool {
        matches!(self, Self::NodeError | Self::TimedOut | Self::Cancelled)
    }
}

impl fmt::Display for CompletionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final decision of a batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: u64,
    pub topology_version: TopologyVersion,
    pub evicted: Vec<EvictionCandidate>,
    pub rejected: Vec<EvictionCandidate>,
    /// Near readers that confirmed eviction, per evicted key
    pub evicted_readers: HashMap<CacheKey, Vec<NodeId>>,
    /// Nodes that answered with `error = true`
    pub error_nodes: Vec<NodeId>,
    pub cause: CompletionCause,
}

impl BatchOutcome {
    pub fn is_evicted(&self, key: &str) -> bool {
        self.evicted.iter().any(|c| c.key() == key)
    }

    pub fn is_rejected(&self, key: &str) -> bool {
        self.rejected.iter().any(|c| c.key() == key)
    }
}

pub type Continuation = Box<dyn FnOnce(&BatchOutcome) + Send + 'static>;

pub struct EvictionBatch {
    id: u64,
    state: AtomicU8,
    collected: Mutex<Vec<EvictionCandidate>>,
    topology_version: AtomicI64,
    candidates: DashMap<CacheKey, EvictionCandidate>,
    readers: DashMap<CacheKey, HashSet<NodeId>>,
    requests: DashMap<NodeId, EvictionRequest>,
    responses: DashMap<NodeId, EvictionResponse>,
    /// Rejected before any response (request could not be sent)
    rejected: DashMap<CacheKey, EvictionCandidate>,
    /// Nodes that answered with an error after leaving the grid
    departed_errors: Mutex<Vec<NodeId>>,
    timeout: Mutex<Option<TimerHandle>>,
    timer: Arc<dyn TimerService>,
    continuations: Mutex<Vec<Continuation>>,
    outcome: OnceLock<Arc<BatchOutcome>>,
    started: BatchTimer,
}

impl EvictionBatch {
    pub fn new(id: u64, timer: Arc<dyn TimerService>) -> Self {
        Self {
            id,
            state: AtomicU8::new(BatchState::Collecting as u8),
            collected: Mutex::new(Vec::new()),
            topology_version: AtomicI64::new(-1),
            candidates: DashMap::new(),
            readers: DashMap::new(),
            requests: DashMap::new(),
            responses: DashMap::new(),
            rejected: DashMap::new(),
            departed_errors: Mutex::new(Vec::new()),
            timeout: Mutex::new(None),
            timer,
            continuations: Mutex::new(Vec::new()),
            outcome: OnceLock::new(),
            started: BatchTimer::start(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> BatchState {
        BatchState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_done(&self) -> bool {
        self.state() == BatchState::Done
    }

    /// Topology version snapshotted during preparation (-1 before).
    pub fn topology_version(&self) -> TopologyVersion {
        self.topology_version.load(Ordering::Acquire)
    }

    /// Candidates collected so far, or tracked once prepared.
    pub fn len(&self) -> usize {
        match self.state() {
            BatchState::Collecting => self.collected.lock().len(),
            _ => self.candidates.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes we still expect to hear from.
    pub fn pending_nodes(&self) -> Vec<NodeId> {
        self.requests
            .iter()
            .filter(|r| !self.responses.contains_key(r.key()))
            .map(|r| *r.key())
            .collect()
    }

    pub fn outcome(&self) -> Option<Arc<BatchOutcome>> {
        self.outcome.get().cloned()
    }

    // --- Collecting ---

    /// Add candidates; handed back if the batch is no longer collecting.
    pub fn add(&self, candidates: Vec<EvictionCandidate>) -> Result<(), Vec<EvictionCandidate>> {
        let mut collected = self.collected.lock();
        if self.state() != BatchState::Collecting {
            return Err(candidates);
        }
        collected.extend(candidates);
        Ok(())
    }

    // --- Preparing ---

    /// Move to `Preparing` and take the collected candidates.
    ///
    /// `None` if another thread already started preparing (or the batch
    /// was cancelled).
    pub fn begin_prepare(&self, topology_version: TopologyVersion) -> Option<Vec<EvictionCandidate>> {
        let mut collected = self.collected.lock();
        self.state
            .compare_exchange(
                BatchState::Collecting as u8,
                BatchState::Preparing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;
        self.topology_version.store(topology_version, Ordering::Release);
        Some(std::mem::take(&mut *collected))
    }

    /// Track a candidate that needs confirmation from `backups` and `readers`.
    pub fn track(&self, candidate: EvictionCandidate, backups: &[NodeId], readers: &[NodeId]) {
        let key = candidate.key().clone();
        let version = candidate.version;
        let topology_version = self.topology_version();

        let reader_set: HashSet<NodeId> = readers.iter().copied().collect();
        let mut nodes: Vec<NodeId> = backups.to_vec();
        nodes.extend(readers.iter().filter(|r| !backups.contains(r)));

        for node in nodes {
            self.requests
                .entry(node)
                .or_insert_with(|| EvictionRequest::new(self.id, topology_version))
                .add_key(key.clone(), version, reader_set.contains(&node));
        }

        self.readers.insert(key.clone(), reader_set);
        self.candidates.insert(key, candidate);
    }

    pub fn has_candidates(&self) -> bool {
        !self.candidates.is_empty()
    }

    /// Snapshot of the requests to dispatch.
    pub fn requests(&self) -> Vec<(NodeId, EvictionRequest)> {
        self.requests.iter().map(|r| (*r.key(), r.value().clone())).collect()
    }

    /// Arm the batch timeout. Skipped if the batch already finished.
    pub fn register_timeout(self: &Arc<Self>, after: Duration) {
        let batch = Arc::downgrade(self);
        let mut slot = self.timeout.lock();
        if self.is_done() {
            return;
        }
        *slot = Some(self.timer.schedule(
            after,
            Box::new(move || {
                if let Some(batch) = batch.upgrade() {
                    batch.complete(CompletionCause::TimedOut);
                }
            }),
        ));
    }

    /// Preparation finished: start evaluating completion.
    pub fn finish_prepare(&self) {
        if self
            .state
            .compare_exchange(
                BatchState::Preparing as u8,
                BatchState::AwaitingResponses as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        if self.responses.iter().any(|r| r.value().error) {
            self.complete(CompletionCause::NodeError);
        } else {
            self.check_done();
        }
    }

    // --- AwaitingResponses ---

    /// Record a response. Returns `false` if the batch already finished.
    pub fn on_response(&self, node: NodeId, response: EvictionResponse, node_alive: bool) -> bool {
        if self.is_done() {
            debug!(batch_id = self.id, node = %node, "Ignored eviction response for finished batch");
            return false;
        }

        let error = response.error;
        if node_alive {
            self.responses.insert(node, response);
        } else {
            // Sender left the grid after answering
            self.requests.remove(&node);
            if error {
                self.departed_errors.lock().push(node);
            }
        }

        if error && self.state() == BatchState::AwaitingResponses {
            self.complete(CompletionCause::NodeError);
        } else {
            self.check_done();
        }
        true
    }

    /// Stop waiting for `node`.
    pub fn on_node_left(&self, node: NodeId) {
        if self.is_done() {
            return;
        }
        self.requests.remove(&node);
        self.responses.remove(&node);
        self.check_done();
    }

    /// Reject every key addressed to `node` (request could not be sent).
    pub fn reject_node(&self, node: NodeId) {
        if self.is_done() {
            return;
        }
        if let Some((_, request)) = self.requests.remove(&node) {
            debug!(batch_id = self.id, node = %node, keys = request.entries.len(), "Rejecting entries for node");
            for key in request.keys() {
                if let Some(candidate) = self.candidates.get(key) {
                    self.rejected.insert(key.clone(), candidate.value().clone());
                }
            }
        }
        self.check_done();
    }

    fn check_done(&self) {
        if self.state() != BatchState::AwaitingResponses {
            return;
        }
        let done = self.requests.is_empty() || self.requests.iter().all(|r| self.responses.contains_key(r.key()));
        if done {
            self.complete(CompletionCause::Responses);
        }
    }

    // --- Done ---

    pub fn cancel(&self) -> bool {
        self.complete(CompletionCause::Cancelled)
    }

    /// One-shot transition into `Done`. Returns `true` for the caller that won.
    pub fn complete(&self, cause: CompletionCause) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == BatchState::Done as u8 {
                return false;
            }
            match self.state.compare_exchange(current, BatchState::Done as u8, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if let Some(handle) = self.timeout.lock().take() {
            // A fired timer has already deregistered itself
            if cause != CompletionCause::TimedOut {
                self.timer.cancel(handle);
            }
        }

        let outcome = Arc::new(self.build_outcome(cause));
        metrics::record_batch_completed(cause.as_str(), self.started.elapsed());
        metrics::record_rejected(
            match cause {
                CompletionCause::TimedOut => "timeout",
                CompletionCause::NodeError => "error",
                CompletionCause::Cancelled => "cancelled",
                _ => "remote",
            },
            outcome.rejected.len(),
        );

        debug!(
            batch_id = self.id,
            cause = %cause,
            evicted = outcome.evicted.len(),
            rejected = outcome.rejected.len(),
            "Eviction batch completed"
        );

        let _ = self.outcome.set(Arc::clone(&outcome));
        let continuations = std::mem::take(&mut *self.continuations.lock());
        for f in continuations {
            f(&outcome);
        }
        true
    }

    /// Run `f` once the batch is done (immediately if it already is).
    pub fn on_complete(&self, f: Continuation) {
        let mut continuations = self.continuations.lock();
        match self.outcome.get() {
            Some(outcome) => {
                let outcome = Arc::clone(outcome);
                drop(continuations);
                f(&outcome);
            }
            None => continuations.push(f),
        }
    }

    fn build_outcome(&self, cause: CompletionCause) -> BatchOutcome {
        let mut error_nodes: Vec<NodeId> = self
            .responses
            .iter()
            .filter(|r| r.value().error)
            .map(|r| *r.key())
            .collect();
        error_nodes.extend(self.departed_errors.lock().iter().copied());

        if !error_nodes.is_empty() {
            let err = EvictionError::RemoteProtocol { nodes: error_nodes.clone() };
            warn!(
                batch_id = self.id,
                error = %err,
                "Remote node(s) failed to process eviction request (some backup or near values may be lost)"
            );
        }

        if cause == CompletionCause::TimedOut {
            warn!(
                batch_id = self.id,
                pending = ?self.pending_nodes(),
                "Timed out waiting for eviction batch (consider changing 'evict_synchronized_timeout_ms' \
                 and 'evict_synchronized_concurrency_level')"
            );
        }

        let mut evicted = Vec::new();
        let mut rejected = Vec::new();
        let mut evicted_readers = HashMap::new();

        if cause.rejects_all() || !error_nodes.is_empty() {
            rejected.extend(self.candidates.iter().map(|c| c.value().clone()));
        } else {
            for c in self.candidates.iter() {
                let key = c.key();
                let refused = self.rejected.contains_key(key)
                    || self.responses.iter().any(|r| r.value().rejected_keys.contains(key));
                if refused {
                    rejected.push(c.value().clone());
                    continue;
                }

                let readers = self.evicted_readers(key);
                if !readers.is_empty() {
                    evicted_readers.insert(key.clone(), readers);
                }
                evicted.push(c.value().clone());
            }
        }

        BatchOutcome {
            batch_id: self.id,
            topology_version: self.topology_version(),
            evicted,
            rejected,
            evicted_readers,
            error_nodes,
            cause,
        }
    }

    /// Readers of `key` that answered without rejecting it.
    fn evicted_readers(&self, key: &str) -> Vec<NodeId> {
        let Some(readers) = self.readers.get(key) else {
            return Vec::new();
        };
        readers
            .iter()
            .filter(|node| {
                self.responses
                    .get(*node)
                    .is_some_and(|r| !r.rejected_keys.contains(key))
            })
            .copied()
            .collect()
    }
}

impl fmt::Debug for EvictionBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictionBatch")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("topology_version", &self.topology_version())
            .field("candidates", &self.candidates.len())
            .field("pending", &self.pending_nodes().len())
            .finish()
    }
}
