// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster collaborators: node identity, partition topology, messaging, timers.

pub mod messaging;
pub mod timer;
pub mod topology;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub use messaging::{EvictionMessage, EvictionRequest, EvictionResponse, Messaging, MessagingError, RequestEntry};
pub use timer::{TimerHandle, TimerService, TokioTimer};
pub use topology::{ClusterState, InMemoryTopology, PartitionTopology};

/// Grid node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First group is enough to tell nodes apart in logs
        let s = self.0.to_string();
        f.write_str(s.split('-').next().unwrap_or(&s))
    }
}

/// Membership change delivered to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyEvent {
    NodeJoined(NodeId),
    NodeLeft(NodeId),
    NodeFailed(NodeId),
}

impl TopologyEvent {
    pub fn node(&self) -> NodeId {
        match self {
            Self::NodeJoined(n) | Self::NodeLeft(n) | Self::NodeFailed(n) => *n,
        }
    }

    /// Node left the grid, gracefully or not.
    pub fn is_departure(&self) -> bool {
        matches!(self, Self::NodeLeft(_) | Self::NodeFailed(_))
    }
}
