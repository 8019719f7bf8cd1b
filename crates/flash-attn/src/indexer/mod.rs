//! Sequence indexing for padded and ragged batches.
//!
//! Both layouts are flattened to a token-major view (`[tokens, heads, dim]`)
//! and described by one [`SequenceSpan`] per batch element. A padded batch of
//! `batch` sequences of length `s` occupies tokens `b * s .. (b + 1) * s`; a
//! ragged batch uses the cumulative offsets directly. Everything downstream
//! iterates spans and tiles, so the two layouts share a single code path.

use std::ops::Range;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::core::{AttentionError, Result};

/// Token ranges of one batch element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSpan {
    /// First query token in the flattened query buffer.
    pub q_start: usize,
    /// Number of query rows taking part in attention.
    pub q_len: usize,
    /// First key token in the flattened key buffer.
    pub k_start: usize,
    /// Number of keys visible to this sequence.
    pub k_len: usize,
}

impl SequenceSpan {
    /// Query-tile ranges, local to the sequence.
    pub fn query_tiles(&self, tile: usize) -> TileIter {
        TileIter::new(self.q_len, tile)
    }

    /// Key-tile ranges, local to the sequence.
    pub fn key_tiles(&self, tile: usize) -> TileIter {
        TileIter::new(self.k_len, tile)
    }
}

/// Iterator over `[start, end)` tile ranges covering `0..len`.
#[derive(Debug, Clone)]
pub struct TileIter {
    next: usize,
    len: usize,
    tile: usize,
}

impl TileIter {
    pub fn new(len: usize, tile: usize) -> Self {
        Self {
            next: 0,
            len,
            tile: tile.max(1),
        }
    }
}

impl Iterator for TileIter {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.len {
            return None;
        }
        let start = self.next;
        self.next = (start + self.tile).min(self.len);
        Some(start..self.next)
    }
}

/// How the query and key tokens of a call are grouped into sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SeqLayout {
    /// Rectangular `[batch, seq, ..]` tensors, optionally with fewer valid
    /// rows per element than the padded length.
    Padded {
        batch: usize,
        seqlen_q: usize,
        seqlen_k: usize,
        valid_q: Option<Vec<usize>>,
        valid_k: Option<Vec<usize>>,
    },
    /// Packed sequences addressed through cumulative offsets.
    Ragged {
        cu_seqlens_q: Vec<usize>,
        cu_seqlens_k: Vec<usize>,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
    },
}

impl SeqLayout {
    /// Padded layout where every row is valid.
    pub fn padded(batch: usize, seqlen_q: usize, seqlen_k: usize) -> Self {
        Self::Padded {
            batch,
            seqlen_q,
            seqlen_k,
            valid_q: None,
            valid_k: None,
        }
    }

    /// Padded layout restricted to per-element valid lengths.
    pub fn padded_with_lengths(
        batch: usize,
        seqlen_q: usize,
        seqlen_k: usize,
        valid_q: Option<Vec<usize>>,
        valid_k: Option<Vec<usize>>,
    ) -> Result<Self> {
        for (name, lengths, limit) in [
            ("valid_q_lengths", &valid_q, seqlen_q),
            ("valid_k_lengths", &valid_k, seqlen_k),
        ] {
            let Some(lengths) = lengths else { continue };
            if lengths.len() != batch {
                return Err(AttentionError::shape(format!(
                    "{name} has {} entries for batch {batch}",
                    lengths.len()
                )));
            }
            if let Some((b, &len)) = lengths.iter().enumerate().find(|(_, len)| **len > limit) {
                return Err(AttentionError::capacity(format!(
                    "{name}[{b}] = {len} exceeds padded length {limit}"
                )));
            }
        }
        Ok(Self::Padded {
            batch,
            seqlen_q,
            seqlen_k,
            valid_q,
            valid_k,
        })
    }

    /// Ragged layout; offsets and maxima are validated here.
    pub fn ragged(
        cu_seqlens_q: Vec<usize>,
        cu_seqlens_k: Vec<usize>,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
    ) -> Result<Self> {
        validate_cu_seqlens(&cu_seqlens_q, max_seqlen_q, "cu_seqlens_q")?;
        validate_cu_seqlens(&cu_seqlens_k, max_seqlen_k, "cu_seqlens_k")?;
        if cu_seqlens_q.len() != cu_seqlens_k.len() {
            return Err(AttentionError::shape(format!(
                "cu_seqlens_q describes {} sequences but cu_seqlens_k describes {}",
                cu_seqlens_q.len() - 1,
                cu_seqlens_k.len() - 1
            )));
        }
        Ok(Self::Ragged {
            cu_seqlens_q,
            cu_seqlens_k,
            max_seqlen_q,
            max_seqlen_k,
        })
    }

    pub fn batch(&self) -> usize {
        match self {
            Self::Padded { batch, .. } => *batch,
            Self::Ragged { cu_seqlens_q, .. } => cu_seqlens_q.len() - 1,
        }
    }

    /// Re-run the constructor checks on a layout that did not come from
    /// them, such as one read back from JSON.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Padded {
                batch,
                seqlen_q,
                seqlen_k,
                valid_q,
                valid_k,
            } => {
                Self::padded_with_lengths(
                    *batch,
                    *seqlen_q,
                    *seqlen_k,
                    valid_q.clone(),
                    valid_k.clone(),
                )?;
            }
            Self::Ragged {
                cu_seqlens_q,
                cu_seqlens_k,
                max_seqlen_q,
                max_seqlen_k,
            } => {
                Self::ragged(
                    cu_seqlens_q.clone(),
                    cu_seqlens_k.clone(),
                    *max_seqlen_q,
                    *max_seqlen_k,
                )?;
            }
        }
        Ok(())
    }

    pub fn is_ragged(&self) -> bool {
        matches!(self, Self::Ragged { .. })
    }

    /// Rows in the flattened query buffer.
    pub fn total_q(&self) -> usize {
        match self {
            Self::Padded {
                batch, seqlen_q, ..
            } => batch * seqlen_q,
            Self::Ragged { cu_seqlens_q, .. } => cu_seqlens_q.last().copied().unwrap_or(0),
        }
    }

    /// Rows in the flattened key buffer.
    pub fn total_k(&self) -> usize {
        match self {
            Self::Padded {
                batch, seqlen_k, ..
            } => batch * seqlen_k,
            Self::Ragged { cu_seqlens_k, .. } => cu_seqlens_k.last().copied().unwrap_or(0),
        }
    }

    /// One span per batch element.
    pub fn spans(&self) -> Vec<SequenceSpan> {
        match self {
            Self::Padded {
                batch,
                seqlen_q,
                seqlen_k,
                valid_q,
                valid_k,
            } => (0..*batch)
                .map(|b| SequenceSpan {
                    q_start: b * seqlen_q,
                    q_len: valid_q.as_ref().map_or(*seqlen_q, |v| v[b]),
                    k_start: b * seqlen_k,
                    k_len: valid_k.as_ref().map_or(*seqlen_k, |v| v[b]),
                })
                .collect(),
            Self::Ragged {
                cu_seqlens_q,
                cu_seqlens_k,
                ..
            } => cu_seqlens_q
                .windows(2)
                .zip(cu_seqlens_k.windows(2))
                .map(|(q, k)| SequenceSpan {
                    q_start: q[0],
                    q_len: q[1] - q[0],
                    k_start: k[0],
                    k_len: k[1] - k[0],
                })
                .collect(),
        }
    }
}

/// Check that `cu_seqlens` starts at zero, never decreases and that no
/// sequence is longer than `max_seqlen`.
pub fn validate_cu_seqlens(cu_seqlens: &[usize], max_seqlen: usize, name: &str) -> Result<()> {
    if cu_seqlens.len() < 2 {
        return Err(AttentionError::shape(format!(
            "{name} must hold batch + 1 >= 2 offsets, got {}",
            cu_seqlens.len()
        )));
    }
    if cu_seqlens[0] != 0 {
        return Err(AttentionError::shape(format!(
            "{name} must start at 0, got {}",
            cu_seqlens[0]
        )));
    }
    for (b, pair) in cu_seqlens.windows(2).enumerate() {
        if pair[1] < pair[0] {
            return Err(AttentionError::shape(format!(
                "{name} decreases at sequence {b}: {} -> {}",
                pair[0], pair[1]
            )));
        }
        let len = pair[1] - pair[0];
        if len > max_seqlen {
            return Err(AttentionError::capacity(format!(
                "{name}: sequence {b} has length {len} above max_seqlen {max_seqlen}"
            )));
        }
    }
    Ok(())
}

/// Read an integer index tensor (`u8`, `u32` or `i64`) into host indices.
pub fn index_vec(tensor: &Tensor, name: &str) -> Result<Vec<usize>> {
    let flat = tensor.flatten_all()?;
    match tensor.dtype() {
        DType::U8 => Ok(flat.to_vec1::<u8>()?.into_iter().map(usize::from).collect()),
        DType::U32 => Ok(flat
            .to_vec1::<u32>()?
            .into_iter()
            .map(|v| v as usize)
            .collect()),
        DType::I64 => flat
            .to_vec1::<i64>()?
            .into_iter()
            .map(|v| {
                usize::try_from(v).map_err(|_| {
                    AttentionError::shape(format!("{name} contains negative index {v}"))
                })
            })
            .collect(),
        other => Err(AttentionError::dtype(format!(
            "{name} must be an integer tensor (u8, u32, i64), got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests;
