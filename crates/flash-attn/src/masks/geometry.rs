//! Visibility rules for one `(sequence, head)` score matrix.
//!
//! Masks are aligned to the bottom-right corner: query `i` sits on the
//! diagonal `i + seqlen_k - seqlen_q`. Causal masking hides keys right of the
//! diagonal, a window hides keys more than `left` before or `right` after it.

use std::ops::Range;

use crate::core::Window;

/// Window extents beyond `i64::MAX` reach every key anyway.
fn extent(side: usize) -> i64 {
    i64::try_from(side).unwrap_or(i64::MAX)
}

/// Masking rule for a single sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskGeometry {
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    pub causal: bool,
    pub window: Window,
}

impl MaskGeometry {
    pub fn new(seqlen_q: usize, seqlen_k: usize, causal: bool, window: Window) -> Self {
        Self {
            seqlen_q,
            seqlen_k,
            causal,
            window,
        }
    }

    /// Unmasked geometry.
    pub fn full(seqlen_q: usize, seqlen_k: usize) -> Self {
        Self::new(seqlen_q, seqlen_k, false, Window::UNBOUNDED)
    }

    fn diagonal(&self, row: usize) -> i64 {
        row as i64 + self.seqlen_k as i64 - self.seqlen_q as i64
    }

    /// Keys visible from query row `row`, or `None` when the row is fully
    /// masked.
    pub fn key_bounds(&self, row: usize) -> Option<Range<usize>> {
        if self.seqlen_k == 0 {
            return None;
        }
        let diag = self.diagonal(row);
        let mut hi = self.seqlen_k as i64 - 1;
        if self.causal {
            hi = hi.min(diag);
        }
        if let Some(right) = self.window.right {
            hi = hi.min(diag.saturating_add(extent(right)));
        }
        let lo = match self.window.left {
            Some(left) => diag.saturating_sub(extent(left)).max(0),
            None => 0,
        };
        if hi < lo {
            return None;
        }
        Some(lo as usize..hi as usize + 1)
    }

    /// Visible keys of `row` restricted to `keys`.
    pub fn row_keys(&self, row: usize, keys: &Range<usize>) -> Option<Range<usize>> {
        let bounds = self.key_bounds(row)?;
        let start = bounds.start.max(keys.start);
        let end = bounds.end.min(keys.end);
        (start < end).then_some(start..end)
    }

    pub fn allows(&self, row: usize, key: usize) -> bool {
        self.key_bounds(row)
            .map(|bounds| bounds.contains(&key))
            .unwrap_or(false)
    }

    /// Whether no row of `rows` sees any key of `keys`; such a tile is
    /// skipped without computing a single score.
    pub fn tile_is_masked(&self, rows: &Range<usize>, keys: &Range<usize>) -> bool {
        rows.clone().all(|row| self.row_keys(row, keys).is_none())
    }

    /// Keys visible from at least one row of `rows`.
    pub fn tile_key_span(&self, rows: &Range<usize>) -> Option<Range<usize>> {
        rows.clone()
            .filter_map(|row| self.key_bounds(row))
            .reduce(|a, b| a.start.min(b.start)..a.end.max(b.end))
    }
}
