//! Tiled online-softmax forward pass.
//!
//! Work is cut into `(sequence, query head, query tile)` units that run in
//! parallel on the engine pool. Each unit streams key tiles through a
//! [`PartialState`] and never materializes the full score matrix. Results are
//! scattered into token-major buffers afterwards, so every output row is
//! written by exactly one unit.

pub(crate) mod kernel;
pub mod state;

use std::ops::Range;

use rayon::prelude::*;

use crate::core::FlashEngine;
use crate::indexer::SequenceSpan;

pub(crate) use kernel::{HeadView, Problem};
pub use state::PartialState;

/// Log-sum-exp reported for rows that see no key at all.
pub const LSE_MASKED: f32 = f32::NEG_INFINITY;

/// One independent slice of forward work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueryUnit {
    pub batch: usize,
    pub head: usize,
    pub rows: Range<usize>,
}

/// Every query tile of every head of every span, in launch order.
pub(crate) fn query_units(spans: &[SequenceSpan], heads_q: usize, tile_q: usize) -> Vec<QueryUnit> {
    spans
        .iter()
        .enumerate()
        .flat_map(|(batch, span)| {
            (0..heads_q).flat_map(move |head| {
                span.query_tiles(tile_q)
                    .map(move |rows| QueryUnit { batch, head, rows })
            })
        })
        .collect()
}

/// Token-major forward results: `out` is `[tokens, heads_q, dim]` and `lse`
/// is `[tokens, heads_q]`.
#[derive(Debug, Clone)]
pub(crate) struct ForwardBuffers {
    pub out: Vec<f32>,
    pub lse: Vec<f32>,
    heads: usize,
    dim: usize,
}

impl ForwardBuffers {
    /// Zero outputs with every row marked as masked; rows no unit covers
    /// keep that state.
    pub(crate) fn new(tokens: usize, heads: usize, dim: usize) -> Self {
        Self {
            out: vec![0.0; tokens * heads * dim],
            lse: vec![LSE_MASKED; tokens * heads],
            heads,
            dim,
        }
    }

    pub(crate) fn store(&mut self, span: &SequenceSpan, unit: &QueryUnit, out: &[f32], lse: &[f32]) {
        for (local, row) in unit.rows.clone().enumerate() {
            let token = span.q_start + row;
            let slot = token * self.heads + unit.head;
            self.lse[slot] = lse[local];
            self.out[slot * self.dim..(slot + 1) * self.dim]
                .copy_from_slice(&out[local * self.dim..(local + 1) * self.dim]);
        }
    }
}

/// Single-pass forward over `total_q` query tokens.
pub(crate) fn run(
    engine: &FlashEngine,
    problem: &Problem<'_>,
    spans: &[SequenceSpan],
    total_q: usize,
) -> ForwardBuffers {
    let units = query_units(spans, problem.heads_q(), problem.tile_q);
    log::debug!(
        "forward: sequences={} heads_q={} heads_kv={} units={}",
        spans.len(),
        problem.heads_q(),
        problem.heads_kv(),
        units.len()
    );
    let results: Vec<(Vec<f32>, Vec<f32>)> = engine.install(|| {
        units
            .par_iter()
            .map(|unit| {
                let span = &spans[unit.batch];
                problem
                    .sweep(unit.batch, span, unit.head, unit.rows.clone(), 0..span.k_len)
                    .finalize()
            })
            .collect()
    });

    let mut buffers = ForwardBuffers::new(total_q, problem.heads_q(), problem.q.dim());
    for (unit, (out, lse)) in units.iter().zip(&results) {
        buffers.store(&spans[unit.batch], unit, out, lse);
    }
    buffers
}
