// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use thiserror::Error;

use super::swap::SwapEntry;

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("swap write failed: {0}")]
    Write(String),
    #[error("swap record corrupted: {0}")]
    Corrupted(String),
    #[error("swap record could not be encoded: {0}")]
    Encode(String),
}

/// Secondary storage evicted entries are written to (swap space or off-heap).
pub trait SwapStore: Send + Sync {
    /// Write a batch of swap records in one call.
    fn write_all(&self, batch: Vec<SwapEntry>) -> Result<(), SwapError>;
}
