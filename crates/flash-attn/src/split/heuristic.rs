//! Choosing how many key splits a forward call uses.

/// Query-tile height assumed when counting units of work.
pub const BLOCK_M: usize = 64;

/// Key-tile width assumed for a given head dimension.
pub fn block_n(head_dim: usize) -> usize {
    match head_dim {
        0..=64 => 256,
        65..=128 => 128,
        _ => 64,
    }
}

/// Pick the split count whose wave efficiency is within 85% of the best.
///
/// `units` is `batch * heads * query_blocks`, `workers` the number of
/// compute units and `key_blocks` the number of `block_n` key tiles. One
/// split is returned whenever the units alone nearly fill every worker.
pub fn num_splits_heuristic(units: usize, workers: usize, key_blocks: usize, max_splits: usize) -> usize {
    if units as f32 >= 0.8 * workers as f32 {
        return 1;
    }
    let limit = max_splits.min(workers).min(key_blocks).max(1);
    // A split count only helps if it changes the number of blocks per split.
    let eligible = |splits: usize| splits == 1 || key_blocks.div_ceil(splits) != key_blocks.div_ceil(splits - 1);
    let efficiency = |splits: usize| {
        let waves = (units * splits) as f32 / workers as f32;
        waves / waves.ceil()
    };

    let best = (1..=limit)
        .filter(|&s| eligible(s))
        .map(efficiency)
        .fold(0.0f32, f32::max);
    (1..=limit)
        .filter(|&s| eligible(s))
        .find(|&s| efficiency(s) >= 0.85 * best)
        .unwrap_or(1)
}

/// Resolve a requested split count: `0` picks one with
/// [`num_splits_heuristic`], anything else is clamped to `max_splits` and to
/// the number of key tiles.
#[allow(clippy::too_many_arguments)]
pub fn choose_num_splits(
    requested: usize,
    batch_heads: usize,
    seqlen_q: usize,
    seqlen_k: usize,
    head_dim: usize,
    workers: usize,
    max_splits: usize,
    tile_k: usize,
) -> usize {
    let key_tiles = seqlen_k.div_ceil(tile_k.max(1)).max(1);
    let splits = if requested == 0 {
        let units = batch_heads * seqlen_q.div_ceil(BLOCK_M).max(1);
        let key_blocks = seqlen_k.div_ceil(block_n(head_dim)).max(1);
        num_splits_heuristic(units, workers.max(1), key_blocks, max_splits)
    } else {
        requested
    };
    splits.min(max_splits).min(key_tiles).max(1)
}
