//! Split-K forward: key ranges cut into chunks that run in parallel and
//! merge back in order.
//!
//! Splitting adds parallelism when there are too few query tiles to occupy
//! the pool, which is the common case while decoding one token at a time.
//! Chunk boundaries fall on key-tile boundaries and partial states are merged
//! sequentially in chunk order, so a given split count always produces the
//! same bits.

pub mod heuristic;
mod merge;

use std::ops::Range;

use rayon::prelude::*;

use crate::core::FlashEngine;
use crate::forward::{query_units, ForwardBuffers, PartialState, Problem};
use crate::indexer::SequenceSpan;

pub use heuristic::{block_n, choose_num_splits, num_splits_heuristic};

/// Cut `0..len` into at most `splits` chunks whose boundaries are multiples
/// of `tile`.
pub(crate) fn key_chunks(len: usize, tile: usize, splits: usize) -> Vec<Range<usize>> {
    let tile = tile.max(1);
    let tiles = len.div_ceil(tile);
    if tiles == 0 {
        return Vec::new();
    }
    let per_chunk = tiles.div_ceil(splits.max(1)) * tile;
    (0..len)
        .step_by(per_chunk)
        .map(|start| start..(start + per_chunk).min(len))
        .collect()
}

/// Forward over `total_q` query tokens with every unit's keys split
/// `num_splits` ways.
pub(crate) fn run(
    engine: &FlashEngine,
    problem: &Problem<'_>,
    spans: &[SequenceSpan],
    total_q: usize,
    num_splits: usize,
) -> ForwardBuffers {
    let units = query_units(spans, problem.heads_q(), problem.tile_q);
    let work: Vec<(usize, Range<usize>)> = units
        .iter()
        .enumerate()
        .flat_map(|(index, unit)| {
            key_chunks(spans[unit.batch].k_len, problem.tile_k, num_splits)
                .into_iter()
                .map(move |keys| (index, keys))
        })
        .collect();
    log::debug!(
        "split forward: units={} splits={} partials={}",
        units.len(),
        num_splits,
        work.len()
    );

    let partials: Vec<PartialState> = engine.install(|| {
        work.par_iter()
            .map(|(index, keys)| {
                let unit = &units[*index];
                problem.sweep(unit.batch, &spans[unit.batch], unit.head, unit.rows.clone(), keys.clone())
            })
            .collect()
    });

    let dim = problem.q.dim();
    let mut merged: Vec<PartialState> = units
        .iter()
        .map(|unit| PartialState::new(unit.rows.len(), dim))
        .collect();
    for ((index, _), partial) in work.iter().zip(&partials) {
        merged[*index].merge(partial);
    }

    let mut buffers = ForwardBuffers::new(total_q, problem.heads_q(), dim);
    for (unit, state) in units.iter().zip(merged) {
        let (out, lse) = state.finalize();
        buffers.store(&spans[unit.batch], unit, &out, &lse);
    }
    buffers
}
