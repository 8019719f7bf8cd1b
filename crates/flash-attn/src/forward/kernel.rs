//! Tiled sweep over the keys of one `(sequence, head, query tile)` unit.

use std::ops::Range;

use super::state::PartialState;
use crate::core::AttentionParams;
use crate::indexer::SequenceSpan;
use crate::masks::{dot, MaskGeometry, ScoreModifiers};

/// Read-only view over a token-major `[tokens, heads, dim]` buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeadView<'a> {
    data: &'a [f32],
    heads: usize,
    dim: usize,
}

impl<'a> HeadView<'a> {
    pub(crate) fn new(data: &'a [f32], heads: usize, dim: usize) -> Self {
        Self { data, heads, dim }
    }

    #[inline]
    pub(crate) fn row(&self, token: usize, head: usize) -> &'a [f32] {
        let start = (token * self.heads + head) * self.dim;
        &self.data[start..start + self.dim]
    }

    pub(crate) fn heads(&self) -> usize {
        self.heads
    }

    pub(crate) fn dim(&self) -> usize {
        self.dim
    }
}

/// Everything a unit of work needs to recompute scores.
///
/// `q` holds `heads_q` heads and `k`/`v` hold `heads_q / group` heads; all
/// three share the padded head dimension.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Problem<'a> {
    pub q: HeadView<'a>,
    pub k: HeadView<'a>,
    pub v: HeadView<'a>,
    pub scale: f32,
    pub params: &'a AttentionParams,
    pub tile_q: usize,
    pub tile_k: usize,
}

impl<'a> Problem<'a> {
    pub(crate) fn heads_q(&self) -> usize {
        self.q.heads()
    }

    pub(crate) fn heads_kv(&self) -> usize {
        self.k.heads()
    }

    /// Query heads sharing one key/value head.
    pub(crate) fn group(&self) -> usize {
        self.heads_q() / self.heads_kv().max(1)
    }

    #[inline]
    pub(crate) fn kv_head(&self, head: usize) -> usize {
        head / self.group()
    }

    pub(crate) fn geometry(&self, span: &SequenceSpan) -> MaskGeometry {
        MaskGeometry::new(span.q_len, span.k_len, self.params.causal, self.params.window)
    }

    pub(crate) fn modifiers(&self, batch: usize, head: usize, span: &SequenceSpan) -> ScoreModifiers {
        let slope = self.params.alibi.as_ref().map(|alibi| alibi.slope(batch, head));
        ScoreModifiers::new(self.scale, self.params.softcap, slope, span.q_len, span.k_len)
    }

    /// Absorb keys `keys` (local to the sequence) into a fresh state for
    /// query rows `rows` of head `head`.
    pub(crate) fn sweep(
        &self,
        batch: usize,
        span: &SequenceSpan,
        head: usize,
        rows: Range<usize>,
        keys: Range<usize>,
    ) -> PartialState {
        let geometry = self.geometry(span);
        let mods = self.modifiers(batch, head, span);
        let kv_head = self.kv_head(head);
        let mut state = PartialState::new(rows.len(), self.q.dim());
        let mut scores = Vec::with_capacity(self.tile_k);

        let mut start = keys.start;
        while start < keys.end {
            let tile = start..(start + self.tile_k).min(keys.end);
            start = tile.end;
            if geometry.tile_is_masked(&rows, &tile) {
                log::trace!(
                    "skip masked tile: batch={batch} head={head} rows={rows:?} keys={tile:?}"
                );
                continue;
            }
            for (local, row) in rows.clone().enumerate() {
                let Some(visible) = geometry.row_keys(row, &tile) else {
                    continue;
                };
                let q_row = self.q.row(span.q_start + row, head);
                scores.clear();
                scores.extend(visible.clone().map(|key| {
                    let k_row = self.k.row(span.k_start + key, kv_head);
                    mods.score(dot(q_row, k_row), row, key)
                }));
                state.absorb(
                    local,
                    &scores,
                    visible.map(|key| self.v.row(span.k_start + key, kv_head)),
                );
            }
        }
        state
    }
}
