//! Key/value cache management for incremental decoding.
//!
//! [`KvCache`] is the persistent buffer owned by the caller,
//! [`BlockTable`] maps logical blocks to pages when the cache is paged, and
//! [`CachePlan`] resolves one call's index arrays into validated addressing.

pub mod block_table;
pub mod layout;
pub mod plan;
pub mod store;

use candle_core::Tensor;

pub use block_table::BlockTable;
pub use layout::CacheLayout;
pub use plan::{CachePlan, PAGE_ALIGNMENT};
pub use store::KvCache;

use crate::core::{AttentionError, Result};
use crate::indexer::index_vec;

/// Number of tokens already cached per sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheSeqlens {
    /// Every sequence holds the same number of tokens.
    Uniform(usize),
    /// One length per batch element.
    PerSequence(Vec<usize>),
}

impl CacheSeqlens {
    /// Read a `[batch]` integer tensor.
    pub fn from_tensor(seqlens: &Tensor) -> Result<Self> {
        Ok(Self::PerSequence(index_vec(seqlens, "cache_seqlens")?))
    }

    /// Expand to one entry per batch element.
    pub fn resolve(&self, batch: usize) -> Result<Vec<usize>> {
        match self {
            Self::Uniform(len) => Ok(vec![*len; batch]),
            Self::PerSequence(lens) if lens.len() == batch => Ok(lens.clone()),
            Self::PerSequence(lens) => Err(AttentionError::shape(format!(
                "cache_seqlens has {} entries for batch {batch}",
                lens.len()
            ))),
        }
    }
}

impl From<usize> for CacheSeqlens {
    fn from(len: usize) -> Self {
        Self::Uniform(len)
    }
}

impl From<Vec<usize>> for CacheSeqlens {
    fn from(lens: Vec<usize>) -> Self {
        Self::PerSequence(lens)
    }
}

#[cfg(test)]
mod tests;
