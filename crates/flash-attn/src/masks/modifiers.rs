//! Score transforms applied between the dot product and masking.

/// Scale, softcap and ALiBi applied to every raw `q · k` product of one head.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreModifiers {
    pub scale: f32,
    /// Disabled when `<= 0`.
    pub softcap: f32,
    pub alibi_slope: Option<f32>,
    /// `seqlen_k - seqlen_q`, the ALiBi distance origin.
    pub diagonal_offset: i64,
}

impl ScoreModifiers {
    pub fn new(scale: f32, softcap: f32, alibi_slope: Option<f32>, seqlen_q: usize, seqlen_k: usize) -> Self {
        Self {
            scale,
            softcap,
            alibi_slope,
            diagonal_offset: seqlen_k as i64 - seqlen_q as i64,
        }
    }

    /// Final score for query row `row` and key `key`.
    #[inline]
    pub fn score(&self, dot: f32, row: usize, key: usize) -> f32 {
        let mut score = dot * self.scale;
        if self.softcap > 0.0 {
            score = self.softcap * (score / self.softcap).tanh();
        }
        if let Some(slope) = self.alibi_slope {
            let distance = (row as i64 + self.diagonal_offset - key as i64).abs();
            score -= slope * distance as f32;
        }
        score
    }

    /// `d score / d (scale * dot)`: `1 - tanh^2` under softcap, else `1`.
    #[inline]
    pub fn softcap_grad(&self, dot: f32) -> f32 {
        if self.softcap > 0.0 {
            let t = (dot * self.scale / self.softcap).tanh();
            1.0 - t * t
        } else {
            1.0
        }
    }
}

#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
