//! Gradient contribution of one `(query rows, key range)` block.
//!
//! Probabilities are rebuilt from the saved log-sum-exp instead of being
//! stored by the forward pass:
//!
//! ```text
//! P  = exp(score - lse)
//! dV += P^T dO
//! dS = P * (dO V^T - D) * softcap'
//! dQ += scale * dS K
//! dK += scale * dS^T Q
//! ```

use std::ops::Range;

use crate::forward::{HeadView, Problem};
use crate::indexer::SequenceSpan;
use crate::masks::dot;

/// Local gradient rows `origin .. origin + len` of one head.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Sink {
    origin: usize,
    dim: usize,
    pub data: Vec<f32>,
}

impl Sink {
    pub(crate) fn zeros(origin: usize, len: usize, dim: usize) -> Self {
        Self {
            origin,
            dim,
            data: vec![0.0; len * dim],
        }
    }

    pub(crate) fn origin(&self) -> usize {
        self.origin
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len() / self.dim.max(1)
    }

    #[inline]
    fn row_mut(&mut self, index: usize) -> &mut [f32] {
        let start = (index - self.origin) * self.dim;
        &mut self.data[start..start + self.dim]
    }

    pub(crate) fn row(&self, local: usize) -> &[f32] {
        &self.data[local * self.dim..(local + 1) * self.dim]
    }

    pub(crate) fn add(&mut self, other: &Sink) {
        let offset = (other.origin - self.origin) * self.dim;
        for (a, b) in self.data[offset..offset + other.data.len()]
            .iter_mut()
            .zip(&other.data)
        {
            *a += b;
        }
    }
}

#[inline]
fn axpy(y: &mut [f32], alpha: f32, x: &[f32]) {
    for (a, &b) in y.iter_mut().zip(x) {
        *a += alpha * b;
    }
}

/// Forward problem plus the tensors saved for its backward pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BackwardProblem<'a> {
    pub fwd: Problem<'a>,
    pub d_out: HeadView<'a>,
    /// `[tokens, heads_q]`.
    pub lse: &'a [f32],
    /// `rowsum(dO * O)`, `[tokens, heads_q]`.
    pub delta: &'a [f32],
}

impl BackwardProblem<'_> {
    /// Add the block's contributions to `dq` (indexed by query row) and to
    /// `dkv` (indexed by key); either side may be skipped.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn accumulate(
        &self,
        batch: usize,
        span: &SequenceSpan,
        head: usize,
        rows: Range<usize>,
        keys: Range<usize>,
        mut dq: Option<&mut Sink>,
        mut dkv: Option<(&mut Sink, &mut Sink)>,
    ) {
        let fwd = &self.fwd;
        let geometry = fwd.geometry(span);
        if geometry.tile_is_masked(&rows, &keys) {
            return;
        }
        let mods = fwd.modifiers(batch, head, span);
        let kv_head = fwd.kv_head(head);
        let heads_q = fwd.heads_q();

        for row in rows {
            let Some(visible) = geometry.row_keys(row, &keys) else {
                continue;
            };
            let token = span.q_start + row;
            let lse = self.lse[token * heads_q + head];
            // Rows that saw no key carry no probability mass.
            if !lse.is_finite() {
                continue;
            }
            let delta = self.delta[token * heads_q + head];
            let q_row = fwd.q.row(token, head);
            let do_row = self.d_out.row(token, head);
            for key in visible {
                let k_row = fwd.k.row(span.k_start + key, kv_head);
                let v_row = fwd.v.row(span.k_start + key, kv_head);
                let raw = dot(q_row, k_row);
                let p = (mods.score(raw, row, key) - lse).exp();
                let dp = dot(do_row, v_row);
                let ds = p * (dp - delta) * mods.softcap_grad(raw) * fwd.scale;
                if let Some(dq) = &mut dq {
                    axpy(dq.row_mut(row), ds, k_row);
                }
                if let Some((dk, dv)) = &mut dkv {
                    axpy(dk.row_mut(key), ds, q_row);
                    axpy(dv.row_mut(key), p, do_row);
                }
            }
        }
    }
}
