// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Eviction wire messages and the transport they travel over.
//!
//! Requests and responses are correlated by `batch_id`, which the initiating
//! node assigns from a monotonically increasing counter.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use super::NodeId;
use crate::entry::CacheKey;
use crate::version::{TopologyVersion, Version};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Destination is no longer part of the grid.
    #[error("node {0} left the grid")]
    NodeLeft(NodeId),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// One key in an eviction request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEntry {
    pub key: CacheKey,
    pub version: Version,
    /// Key lives in the receiver's near cache rather than its partition map
    pub near: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionRequest {
    pub batch_id: u64,
    pub topology_version: TopologyVersion,
    pub entries: Vec<RequestEntry>,
    /// Set by the transport when the payload could not be unmarshalled on
    /// the receiving node (missing class / deployment mismatch).
    #[serde(skip)]
    pub class_error: Option<String>,
}

impl EvictionRequest {
    pub fn new(batch_id: u64, topology_version: TopologyVersion) -> Self {
        Self {
            batch_id,
            topology_version,
            entries: Vec::new(),
            class_error: None,
        }
    }

    pub fn add_key(&mut self, key: CacheKey, version: Version, near: bool) {
        self.entries.push(RequestEntry { key, version, near });
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.iter().map(|e| &e.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvictionResponse {
    pub batch_id: u64,
    pub rejected_keys: HashSet<CacheKey>,
    /// Receiver failed to process the request at all
    pub error: bool,
}

impl EvictionResponse {
    pub fn new(batch_id: u64) -> Self {
        Self {
            batch_id,
            ..Default::default()
        }
    }

    pub fn error(batch_id: u64) -> Self {
        Self {
            batch_id,
            rejected_keys: HashSet::new(),
            error: true,
        }
    }

    pub fn reject(&mut self, key: CacheKey) {
        self.rejected_keys.insert(key);
    }
}

/// Anything exchanged between eviction coordinators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvictionMessage {
    Request(EvictionRequest),
    Response(EvictionResponse),
}

impl EvictionMessage {
    pub fn batch_id(&self) -> u64 {
        match self {
            Self::Request(r) => r.batch_id,
            Self::Response(r) => r.batch_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(self).map_err(|e| MessagingError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessagingError> {
        serde_json::from_slice(bytes).map_err(|e| MessagingError::Malformed(e.to_string()))
    }
}

/// Point-to-point delivery of eviction messages.
///
/// `send` must not block on the receiver processing the message.
pub trait Messaging: Send + Sync {
    fn send(&self, to: NodeId, message: EvictionMessage) -> Result<(), MessagingError>;
}
