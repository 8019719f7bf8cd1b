//! Recompute-based backward pass.
//!
//! Scores and probabilities are regenerated tile by tile from `Q`, `K` and
//! the saved log-sum-exp, so memory stays linear in sequence length. Two
//! schedules share the same block kernel:
//!
//! * [`deterministic`] reduces every gradient row on one thread in a fixed
//!   order and is bitwise reproducible.
//! * [`unordered`] lets threads add into shared accumulators as they finish.

mod deterministic;
mod recompute;
mod unordered;

use rayon::prelude::*;

use crate::core::FlashEngine;
use crate::indexer::SequenceSpan;

pub(crate) use recompute::BackwardProblem;
use recompute::Sink;

/// Token-major gradients matching the padded forward buffers.
#[derive(Debug, Clone)]
pub(crate) struct GradBuffers {
    pub dq: Vec<f32>,
    pub dk: Vec<f32>,
    pub dv: Vec<f32>,
    heads_q: usize,
    heads_kv: usize,
    dim: usize,
}

impl GradBuffers {
    pub(crate) fn new(total_q: usize, total_k: usize, heads_q: usize, heads_kv: usize, dim: usize) -> Self {
        Self {
            dq: vec![0.0; total_q * heads_q * dim],
            dk: vec![0.0; total_k * heads_kv * dim],
            dv: vec![0.0; total_k * heads_kv * dim],
            heads_q,
            heads_kv,
            dim,
        }
    }

    fn store_q(&mut self, q_start: usize, head: usize, dq: &Sink) {
        for local in 0..dq.len() {
            let slot = (q_start + dq.origin() + local) * self.heads_q + head;
            self.dq[slot * self.dim..(slot + 1) * self.dim].copy_from_slice(dq.row(local));
        }
    }

    fn store_kv(&mut self, k_start: usize, kv_head: usize, dk: &Sink, dv: &Sink) {
        for local in 0..dk.len() {
            let slot = (k_start + dk.origin() + local) * self.heads_kv + kv_head;
            let range = slot * self.dim..(slot + 1) * self.dim;
            self.dk[range.clone()].copy_from_slice(dk.row(local));
            self.dv[range].copy_from_slice(dv.row(local));
        }
    }
}

/// `rowsum(dO * O)` for every `(token, head)` row of width `dim`.
pub(crate) fn compute_delta(engine: &FlashEngine, d_out: &[f32], out: &[f32], dim: usize) -> Vec<f32> {
    engine.install(|| {
        d_out
            .par_chunks(dim)
            .zip(out.par_chunks(dim))
            .map(|(d, o)| d.iter().zip(o).map(|(a, b)| a * b).sum())
            .collect()
    })
}

/// Gradients for every span of `problem`.
pub(crate) fn run(
    engine: &FlashEngine,
    problem: &BackwardProblem<'_>,
    spans: &[SequenceSpan],
    total_q: usize,
    total_k: usize,
    deterministic: bool,
) -> GradBuffers {
    let fwd = &problem.fwd;
    let mut grads = GradBuffers::new(total_q, total_k, fwd.heads_q(), fwd.heads_kv(), fwd.q.dim());
    if deterministic {
        deterministic::run(engine, problem, spans, &mut grads);
    } else {
        unordered::run(engine, problem, spans, &mut grads);
    }
    grads
}
