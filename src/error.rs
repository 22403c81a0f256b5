// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the eviction subsystem.
//!
//! Only construction ([`crate::EvictionCoordinator::new`]) and configuration
//! validation surface these to callers. Everything on the cache read/write
//! path degrades to "entry not evicted, will be reconsidered later" and logs.

use thiserror::Error;

use crate::cluster::messaging::MessagingError;
use crate::cluster::NodeId;
use crate::storage::traits::SwapError;
use crate::version::TopologyVersion;

#[derive(Error, Debug)]
pub enum EvictionError {
    /// Invalid configuration; the subsystem refuses to initialize.
    #[error("invalid eviction configuration: {0}")]
    Configuration(String),

    /// A peer failed to process an eviction request (class loading / deployment).
    #[error("remote node(s) failed to process eviction request: {nodes:?}")]
    RemoteProtocol { nodes: Vec<NodeId> },

    /// Local topology version differs from the one carried by a request.
    #[error("topology version mismatch (local={local}, remote={remote})")]
    TopologyMismatch {
        local: TopologyVersion,
        remote: TopologyVersion,
    },

    /// Entry changed after it was queued for eviction.
    #[error("entry '{key}' changed since it was queued for eviction")]
    VersionConflict { key: String },

    /// Local eviction or swap write failed.
    #[error("local eviction I/O failed: {0}")]
    LocalIo(String),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    /// Subsystem is shutting down and no longer accepts work.
    #[error("eviction subsystem is stopping")]
    Stopping,
}

impl From<SwapError> for EvictionError {
    fn from(err: SwapError) -> Self {
        EvictionError::LocalIo(err.to_string())
    }
}
