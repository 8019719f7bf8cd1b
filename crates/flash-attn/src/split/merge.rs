//! Combining partial states computed over disjoint key ranges.

use crate::forward::PartialState;

impl PartialState {
    /// Fold `other` into `self`, rescaling both sides to the larger running
    /// max.
    ///
    /// The result is the state that would have been produced by sweeping
    /// both key ranges with one accumulator. Merging is performed in split
    /// order by the caller so the rounding sequence is fixed.
    pub fn merge(&mut self, other: &PartialState) {
        debug_assert_eq!(self.rows(), other.rows());
        debug_assert_eq!(self.dim, other.dim);
        let dim = self.dim;
        for row in 0..self.rows() {
            let m_new = self.m[row].max(other.m[row]);
            if m_new == f32::NEG_INFINITY {
                continue;
            }
            let keep = (self.m[row] - m_new).exp();
            let take = (other.m[row] - m_new).exp();
            let acc = &mut self.acc[row * dim..(row + 1) * dim];
            for (a, &b) in acc.iter_mut().zip(&other.acc[row * dim..(row + 1) * dim]) {
                *a = *a * keep + b * take;
            }
            self.l[row] = self.l[row] * keep + other.l[row] * take;
            self.m[row] = m_new;
        }
    }
}
