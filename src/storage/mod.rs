// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local entry storage and swap space.

pub mod memory;
pub mod swap;
pub mod traits;

pub use memory::LocalCache;
pub use swap::{MemorySwapStore, SwapEntry, SwapValue};
pub use traits::{SwapError, SwapStore};
