//! Online-softmax running state for a block of query rows.

use super::LSE_MASKED;

/// Unnormalized accumulator with running max `m` and running sum `l` per
/// row.
///
/// A state covers any contiguous subset of the keys; two states over
/// disjoint key ranges combine with [`PartialState::merge`](crate::split).
#[derive(Debug, Clone, PartialEq)]
pub struct PartialState {
    pub(crate) dim: usize,
    pub(crate) acc: Vec<f32>,
    pub(crate) m: Vec<f32>,
    pub(crate) l: Vec<f32>,
}

impl PartialState {
    /// State that has seen no keys.
    pub fn new(rows: usize, dim: usize) -> Self {
        Self {
            dim,
            acc: vec![0.0; rows * dim],
            m: vec![f32::NEG_INFINITY; rows],
            l: vec![0.0; rows],
        }
    }

    pub fn rows(&self) -> usize {
        self.m.len()
    }

    /// Fold one tile of final scores and their value rows into row `row`.
    pub(crate) fn absorb<'v>(
        &mut self,
        row: usize,
        scores: &[f32],
        values: impl Iterator<Item = &'v [f32]>,
    ) {
        let tile_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let m_old = self.m[row];
        let m_new = m_old.max(tile_max);
        if m_new == f32::NEG_INFINITY {
            return;
        }
        let alpha = (m_old - m_new).exp();
        let acc = &mut self.acc[row * self.dim..(row + 1) * self.dim];
        if alpha != 1.0 {
            acc.iter_mut().for_each(|a| *a *= alpha);
            self.l[row] *= alpha;
        }
        for (&score, value) in scores.iter().zip(values) {
            let p = (score - m_new).exp();
            self.l[row] += p;
            for (a, &v) in acc.iter_mut().zip(value) {
                *a += p * v;
            }
        }
        self.m[row] = m_new;
    }

    /// Normalize into `(out, lse)`; rows that saw no key yield zeros and
    /// [`LSE_MASKED`].
    pub fn finalize(self) -> (Vec<f32>, Vec<f32>) {
        let mut out = self.acc;
        let mut lse = Vec::with_capacity(self.m.len());
        for (row, (&m, &l)) in self.m.iter().zip(&self.l).enumerate() {
            let slice = &mut out[row * self.dim..(row + 1) * self.dim];
            if l == 0.0 || m == f32::NEG_INFINITY {
                slice.fill(0.0);
                lse.push(LSE_MASKED);
            } else {
                let inv = 1.0 / l;
                slice.iter_mut().for_each(|a| *a *= inv);
                lse.push(m + l.ln());
            }
        }
        (out, lse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_tile_matches_softmax() {
        let mut state = PartialState::new(1, 2);
        let values = [[1.0f32, 0.0], [0.0, 1.0]];
        state.absorb(0, &[0.0, 0.0], values.iter().map(|v| v.as_slice()));
        let (out, lse) = state.finalize();
        assert_eq!(out, vec![0.5, 0.5]);
        assert!((lse[0] - 2f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn rescaling_across_tiles_is_exact() {
        let scores = [1.0f32, 3.0, -2.0, 5.0];
        let values: Vec<[f32; 1]> = vec![[1.0], [2.0], [3.0], [4.0]];

        let mut tiled = PartialState::new(1, 1);
        tiled.absorb(0, &scores[..2], values[..2].iter().map(|v| v.as_slice()));
        tiled.absorb(0, &scores[2..], values[2..].iter().map(|v| v.as_slice()));

        let max = 5.0f32;
        let weights: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
        let sum: f32 = weights.iter().sum();
        let expected: f32 = weights.iter().zip(&values).map(|(w, v)| w * v[0]).sum::<f32>() / sum;

        let (out, lse) = tiled.finalize();
        assert!((out[0] - expected).abs() < 1e-6);
        assert!((lse[0] - (max + sum.ln())).abs() < 1e-6);
    }

    #[test]
    fn untouched_rows_finalize_to_the_sentinel() {
        let (out, lse) = PartialState::new(2, 3).finalize();
        assert_eq!(out, vec![0.0; 6]);
        assert_eq!(lse, vec![LSE_MASKED; 2]);
    }
}
