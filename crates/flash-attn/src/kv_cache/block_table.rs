//! Per-sequence page tables for paged caches.

use candle_core::Tensor;

use crate::core::{AttentionError, Result};
use crate::indexer::index_vec;

/// Maps `(sequence, logical block)` to a physical page id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    batch: usize,
    max_blocks: usize,
    entries: Vec<usize>,
}

impl BlockTable {
    /// Build from one row of page ids per sequence; rows must share a length.
    pub fn from_rows(rows: Vec<Vec<usize>>) -> Result<Self> {
        let max_blocks = rows.first().map(Vec::len).unwrap_or(0);
        if let Some((b, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != max_blocks) {
            return Err(AttentionError::shape(format!(
                "block table row {b} has {} entries, expected {max_blocks}",
                row.len()
            )));
        }
        Ok(Self {
            batch: rows.len(),
            max_blocks,
            entries: rows.into_iter().flatten().collect(),
        })
    }

    /// Read a `[batch, max_blocks_per_seq]` integer tensor.
    pub fn from_tensor(table: &Tensor) -> Result<Self> {
        let (batch, max_blocks) = table.dims2().map_err(|_| {
            AttentionError::shape(format!(
                "block table must have shape [batch, max_blocks], got {:?}",
                table.dims()
            ))
        })?;
        Ok(Self {
            batch,
            max_blocks,
            entries: index_vec(table, "block_table")?,
        })
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    /// Physical page of logical block `block` of sequence `seq`.
    pub fn page(&self, seq: usize, block: usize) -> Option<usize> {
        if seq >= self.batch || block >= self.max_blocks {
            return None;
        }
        Some(self.entries[seq * self.max_blocks + block])
    }

    /// `(page, offset)` holding logical position `pos` of sequence `seq`.
    pub fn resolve(&self, seq: usize, pos: usize, page_size: usize) -> Option<(usize, usize)> {
        self.page(seq, pos / page_size)
            .map(|page| (page, pos % page_size))
    }

    /// Blocks required to hold `len` positions.
    pub fn blocks_needed(len: usize, page_size: usize) -> usize {
        len.div_ceil(page_size)
    }
}
