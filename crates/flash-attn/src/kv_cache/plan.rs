//! Per-call resolution of cache addressing.
//!
//! A [`CachePlan`] is built once per `forward_with_cache` call from the
//! caller's index arrays. Construction performs every capacity check, so
//! writing new tokens and gathering keys afterwards cannot go out of bounds.
//!
//! Logical position `p` of batch element `b` lives at storage position
//! `leftpad[b] + p`. Directly addressed caches store it in slot
//! `batch_idx[b]`; paged caches resolve it through the block table.

use super::block_table::BlockTable;
use super::layout::CacheLayout;
use super::store::KvCache;
use crate::core::{AttentionError, Result};
use crate::rotary::{RotaryLayout, RotaryTable};

/// Required granularity of page sizes.
pub const PAGE_ALIGNMENT: usize = 256;

#[derive(Debug, Clone)]
enum Addressing {
    Direct { batch_idx: Vec<usize> },
    Paged { table: BlockTable, page_size: usize },
}

/// Validated addressing for one call.
#[derive(Debug, Clone)]
pub struct CachePlan {
    addressing: Addressing,
    seqlens: Vec<usize>,
    leftpad: Vec<usize>,
    seqlen_new: usize,
}

impl CachePlan {
    /// Validate index arrays against `layout` for a call appending
    /// `seqlen_new` tokens to each of `seqlens.len()` sequences.
    pub fn new(
        layout: &CacheLayout,
        seqlens: Vec<usize>,
        seqlen_new: usize,
        batch_idx: Option<Vec<usize>>,
        leftpad: Option<Vec<usize>>,
        block_table: Option<BlockTable>,
    ) -> Result<Self> {
        let batch = seqlens.len();
        let leftpad = leftpad.unwrap_or_else(|| vec![0; batch]);
        if leftpad.len() != batch {
            return Err(AttentionError::shape(format!(
                "cache_leftpad has {} entries for batch {batch}",
                leftpad.len()
            )));
        }
        let required = |b: usize| leftpad[b] + seqlens[b] + seqlen_new;

        let addressing = match block_table {
            Some(table) => {
                if batch_idx.is_some() {
                    return Err(AttentionError::unsupported(
                        "cache_batch_idx cannot be combined with a block table",
                    ));
                }
                let page_size = layout.slot_len;
                if page_size % PAGE_ALIGNMENT != 0 {
                    return Err(AttentionError::alignment(format!(
                        "page size {page_size} is not a multiple of {PAGE_ALIGNMENT}"
                    )));
                }
                if table.batch() != batch {
                    return Err(AttentionError::shape(format!(
                        "block table has {} rows for batch {batch}",
                        table.batch()
                    )));
                }
                for b in 0..batch {
                    let blocks = BlockTable::blocks_needed(required(b), page_size);
                    if blocks > table.max_blocks() {
                        return Err(AttentionError::capacity(format!(
                            "sequence {b} needs {blocks} pages, block table holds {}",
                            table.max_blocks()
                        )));
                    }
                    for block in 0..blocks {
                        let page = table.page(b, block).unwrap_or(usize::MAX);
                        if page >= layout.slots {
                            return Err(AttentionError::capacity(format!(
                                "block table entry [{b}][{block}] = {page} outside {} allocated pages",
                                layout.slots
                            )));
                        }
                    }
                }
                Addressing::Paged { table, page_size }
            }
            None => {
                let batch_idx = batch_idx.unwrap_or_else(|| (0..batch).collect());
                if batch_idx.len() != batch {
                    return Err(AttentionError::shape(format!(
                        "cache_batch_idx has {} entries for batch {batch}",
                        batch_idx.len()
                    )));
                }
                for b in 0..batch {
                    if batch_idx[b] >= layout.slots {
                        return Err(AttentionError::capacity(format!(
                            "cache_batch_idx[{b}] = {} but the cache holds {} sequences",
                            batch_idx[b], layout.slots
                        )));
                    }
                    if required(b) > layout.slot_len {
                        return Err(AttentionError::capacity(format!(
                            "sequence {b} needs {} positions, cache holds {}",
                            required(b),
                            layout.slot_len
                        )));
                    }
                }
                Addressing::Direct { batch_idx }
            }
        };

        Ok(Self {
            addressing,
            seqlens,
            leftpad,
            seqlen_new,
        })
    }

    pub fn batch(&self) -> usize {
        self.seqlens.len()
    }

    /// Tokens already cached for batch element `b` before this call.
    pub fn seqlen(&self, b: usize) -> usize {
        self.seqlens[b]
    }

    /// Keys visible to batch element `b` once the new tokens are appended.
    pub fn total_len(&self, b: usize) -> usize {
        self.seqlens[b] + self.seqlen_new
    }

    pub fn is_paged(&self) -> bool {
        matches!(self.addressing, Addressing::Paged { .. })
    }

    #[inline]
    fn locate(&self, b: usize, logical: usize) -> (usize, usize) {
        let storage = self.leftpad[b] + logical;
        match &self.addressing {
            Addressing::Direct { batch_idx } => (batch_idx[b], storage),
            Addressing::Paged { table, page_size } => table
                .resolve(b, storage, *page_size)
                .unwrap_or((usize::MAX, 0)),
        }
    }

    /// Write `[batch, seqlen_new, heads, head_dim]` keys and values, rotating
    /// each key at position `seqlen[b] + t` when a rotary table is supplied.
    /// Rows are rounded to the cache dtype before they are stored.
    ///
    /// Batch elements are written in order, so with duplicate
    /// `cache_batch_idx` entries the last writer wins.
    pub fn append(
        &self,
        cache: &mut KvCache,
        k_new: &[f32],
        v_new: &[f32],
        rotary: Option<(&RotaryTable, RotaryLayout)>,
    ) -> Result<()> {
        let layout = *cache.layout();
        let (heads, head_dim) = (layout.heads, layout.head_dim);
        let mut keys = k_new.to_vec();
        if let Some((table, mode)) = rotary {
            for (row, key) in keys.chunks_exact_mut(head_dim).enumerate() {
                let token = row / heads;
                let (b, t) = (token / self.seqlen_new, token % self.seqlen_new);
                table.rotate(key, self.seqlens[b] + t, mode);
            }
        }
        let keys = cache.round_to_storage(keys)?;
        let values = cache.round_to_storage(v_new.to_vec())?;
        for b in 0..self.batch() {
            for t in 0..self.seqlen_new {
                let (slot, pos) = self.locate(b, self.seqlens[b] + t);
                for h in 0..heads {
                    let src = ((b * self.seqlen_new + t) * heads + h) * head_dim;
                    let rows = src..src + head_dim;
                    cache.write_row(slot, pos, h, &keys[rows.clone()], &values[rows]);
                }
            }
        }
        log::debug!(
            "kv-cache append: batch={} seqlen_new={} paged={}",
            self.batch(),
            self.seqlen_new,
            self.is_paged()
        );
        Ok(())
    }

    /// Copy the visible keys and values of batch element `b` into
    /// token-major `[total_len, heads, padded_dim]` buffers.
    pub fn gather(&self, cache: &KvCache, b: usize, padded_dim: usize) -> (Vec<f32>, Vec<f32>) {
        let layout = cache.layout();
        let (heads, head_dim) = (layout.heads, layout.head_dim);
        let len = self.total_len(b);
        let mut keys = vec![0f32; len * heads * padded_dim];
        let mut values = vec![0f32; len * heads * padded_dim];
        for p in 0..len {
            let (slot, pos) = self.locate(b, p);
            for h in 0..heads {
                let dst = (p * heads + h) * padded_dim;
                keys[dst..dst + head_dim].copy_from_slice(cache.key_row(slot, pos, h));
                values[dst..dst + head_dim].copy_from_slice(cache.value_row(slot, pos, h));
            }
        }
        (keys, values)
    }
}
