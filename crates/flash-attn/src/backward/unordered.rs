//! Single-pass backward sharing accumulators between threads.
//!
//! Each unit owns one key tile of one query head and contributes to the
//! `dQ` rows of the whole sequence. Contributions are added under a lock
//! in completion order, so results agree with the deterministic schedule
//! only up to floating-point reassociation.

use std::sync::{Mutex, PoisonError};

use rayon::prelude::*;

use super::recompute::{BackwardProblem, Sink};
use super::GradBuffers;
use crate::core::FlashEngine;
use crate::indexer::SequenceSpan;

pub(crate) fn run(
    engine: &FlashEngine,
    problem: &BackwardProblem<'_>,
    spans: &[SequenceSpan],
    grads: &mut GradBuffers,
) {
    let fwd = &problem.fwd;
    let (heads_q, heads_kv) = (fwd.heads_q(), fwd.heads_kv());
    let dim = fwd.q.dim();

    let dq_acc: Vec<Mutex<Sink>> = spans
        .iter()
        .flat_map(|span| (0..heads_q).map(move |_| Mutex::new(Sink::zeros(0, span.q_len, dim))))
        .collect();
    let dkv_acc: Vec<Mutex<(Sink, Sink)>> = spans
        .iter()
        .flat_map(|span| {
            (0..heads_kv).map(move |_| {
                Mutex::new((Sink::zeros(0, span.k_len, dim), Sink::zeros(0, span.k_len, dim)))
            })
        })
        .collect();

    let work: Vec<(usize, usize, std::ops::Range<usize>)> = spans
        .iter()
        .enumerate()
        .flat_map(|(batch, span)| {
            (0..heads_q).flat_map(move |head| span.key_tiles(fwd.tile_k).map(move |keys| (batch, head, keys)))
        })
        .collect();

    engine.install(|| {
        work.par_iter().for_each(|(batch, head, keys)| {
            let span = &spans[*batch];
            let mut dq = Sink::zeros(0, span.q_len, dim);
            let mut dk = Sink::zeros(keys.start, keys.len(), dim);
            let mut dv = Sink::zeros(keys.start, keys.len(), dim);
            for rows in span.query_tiles(fwd.tile_q) {
                problem.accumulate(
                    *batch,
                    span,
                    *head,
                    rows,
                    keys.clone(),
                    Some(&mut dq),
                    Some((&mut dk, &mut dv)),
                );
            }
            dq_acc[batch * heads_q + head]
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .add(&dq);
            let mut shared = dkv_acc[batch * heads_kv + fwd.kv_head(*head)]
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            shared.0.add(&dk);
            shared.1.add(&dv);
        });
    });
    log::debug!("unordered backward: units={}", work.len());

    for (index, cell) in dq_acc.into_iter().enumerate() {
        let dq = cell.into_inner().unwrap_or_else(PoisonError::into_inner);
        grads.store_q(spans[index / heads_q].q_start, index % heads_q, &dq);
    }
    for (index, cell) in dkv_acc.into_iter().enumerate() {
        let (dk, dv) = cell.into_inner().unwrap_or_else(PoisonError::into_inner);
        grads.store_kv(spans[index / heads_kv].k_start, index % heads_kv, &dk, &dv);
    }
}
