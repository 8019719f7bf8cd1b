//! Two-pass backward with a fixed reduction order.
//!
//! Pass one owns a key tile of one key/value head and walks every query head
//! of its group and every query tile in ascending order, so each `dK`/`dV`
//! row has exactly one writer. Pass two does the same for `dQ` rows over key
//! tiles. Neither pass shares an accumulator between threads, which makes
//! repeated calls bitwise identical regardless of scheduling.

use std::ops::Range;

use rayon::prelude::*;

use super::recompute::{BackwardProblem, Sink};
use super::GradBuffers;
use crate::core::FlashEngine;
use crate::indexer::SequenceSpan;

struct Unit {
    batch: usize,
    head: usize,
    range: Range<usize>,
}

fn units(spans: &[SequenceSpan], heads: usize, tile: usize, queries: bool) -> Vec<Unit> {
    spans
        .iter()
        .enumerate()
        .flat_map(|(batch, span)| {
            let tiles = if queries {
                span.query_tiles(tile)
            } else {
                span.key_tiles(tile)
            };
            (0..heads).flat_map(move |head| {
                tiles.clone().map(move |range| Unit { batch, head, range })
            })
        })
        .collect()
}

pub(crate) fn run(
    engine: &FlashEngine,
    problem: &BackwardProblem<'_>,
    spans: &[SequenceSpan],
    grads: &mut GradBuffers,
) {
    let fwd = &problem.fwd;
    let dim = fwd.q.dim();
    let group = fwd.group();

    let key_units = units(spans, fwd.heads_kv(), fwd.tile_k, false);
    let dkv: Vec<(Sink, Sink)> = engine.install(|| {
        key_units
            .par_iter()
            .map(|unit| {
                let span = &spans[unit.batch];
                let mut dk = Sink::zeros(unit.range.start, unit.range.len(), dim);
                let mut dv = Sink::zeros(unit.range.start, unit.range.len(), dim);
                for head in unit.head * group..(unit.head + 1) * group {
                    for rows in span.query_tiles(fwd.tile_q) {
                        problem.accumulate(
                            unit.batch,
                            span,
                            head,
                            rows,
                            unit.range.clone(),
                            None,
                            Some((&mut dk, &mut dv)),
                        );
                    }
                }
                (dk, dv)
            })
            .collect()
    });
    for (unit, (dk, dv)) in key_units.iter().zip(&dkv) {
        let span = &spans[unit.batch];
        grads.store_kv(span.k_start, unit.head, dk, dv);
    }

    let query_units = units(spans, fwd.heads_q(), fwd.tile_q, true);
    let dq: Vec<Sink> = engine.install(|| {
        query_units
            .par_iter()
            .map(|unit| {
                let span = &spans[unit.batch];
                let mut dq = Sink::zeros(unit.range.start, unit.range.len(), dim);
                for keys in span.key_tiles(fwd.tile_k) {
                    problem.accumulate(
                        unit.batch,
                        span,
                        unit.head,
                        unit.range.clone(),
                        keys,
                        Some(&mut dq),
                        None,
                    );
                }
                dq
            })
            .collect()
    });
    for (unit, dq) in query_units.iter().zip(&dq) {
        grads.store_q(spans[unit.batch].q_start, unit.head, dq);
    }
    log::debug!(
        "deterministic backward: key units={} query units={}",
        key_units.len(),
        query_units.len()
    );
}
