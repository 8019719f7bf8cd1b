//! Per-call attention parameters.
//!
//! [`AttentionParams`] carries everything that shapes the score matrix of a
//! single call: the softmax scale, causal and sliding-window masking, score
//! softcapping, ALiBi slopes and optional per-sequence valid lengths for the
//! padded layout. The struct is serializable so it can be stored inside a
//! [`SavedContext`](crate::context::SavedContext).

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

/// Sliding-window extent around the bottom-right aligned diagonal.
///
/// Query `i` may attend to keys in
/// `[i + sk - sq - left, i + sk - sq + right]`; a `None` side is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Window {
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl Window {
    /// Window with neither side bounded.
    pub const UNBOUNDED: Window = Window {
        left: None,
        right: None,
    };

    pub fn new(left: Option<usize>, right: Option<usize>) -> Self {
        Self { left, right }
    }

    /// Build a window from signed extents where any negative value means
    /// "infinite context" on that side.
    pub fn from_signed(left: i64, right: i64) -> Self {
        let side = |v: i64| if v < 0 { None } else { Some(v as usize) };
        Self {
            left: side(left),
            right: side(right),
        }
    }

    /// Whether either side of the window is bounded.
    pub fn is_local(&self) -> bool {
        self.left.is_some() || self.right.is_some()
    }
}

/// Additive ALiBi bias coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlibiSlopes {
    /// One slope per query head, shared across the batch.
    PerHead(Vec<f32>),
    /// One slope per `(batch, head)` pair, stored row-major.
    PerBatchHead {
        batch: usize,
        heads: usize,
        slopes: Vec<f32>,
    },
}

impl AlibiSlopes {
    /// Read slopes from an `f32` tensor shaped `[heads]` or `[batch, heads]`.
    pub fn from_tensor(slopes: &Tensor) -> Result<Self> {
        if slopes.dtype() != DType::F32 {
            return Err(AttentionError::dtype(format!(
                "alibi slopes must be f32, got {:?}",
                slopes.dtype()
            )));
        }
        match slopes.rank() {
            1 => Ok(Self::PerHead(slopes.to_vec1::<f32>()?)),
            2 => {
                let (batch, heads) = slopes.dims2()?;
                Ok(Self::PerBatchHead {
                    batch,
                    heads,
                    slopes: slopes.flatten_all()?.to_vec1::<f32>()?,
                })
            }
            rank => Err(AttentionError::shape(format!(
                "alibi slopes must have rank 1 or 2, got rank {rank}"
            ))),
        }
    }

    /// Slope applied to query head `head` of batch element `batch`.
    pub fn slope(&self, batch: usize, head: usize) -> f32 {
        match self {
            Self::PerHead(slopes) => slopes[head],
            Self::PerBatchHead { heads, slopes, .. } => slopes[batch * heads + head],
        }
    }

    pub(crate) fn validate(&self, batch: usize, heads_q: usize) -> Result<()> {
        match self {
            Self::PerHead(slopes) if slopes.len() != heads_q => Err(AttentionError::shape(
                format!("alibi slopes cover {} heads, expected {heads_q}", slopes.len()),
            )),
            Self::PerBatchHead {
                batch: b,
                heads,
                slopes,
            } if *b != batch || *heads != heads_q || slopes.len() != b * heads => {
                Err(AttentionError::shape(format!(
                    "alibi slopes shaped [{b}, {heads}] do not match [{batch}, {heads_q}]"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Knobs shaping the score matrix of one attention call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttentionParams {
    /// Multiplier applied to `Q · Kᵀ`; `None` selects `head_dim^-0.5`.
    pub scale: Option<f32>,
    /// Bottom-right aligned causal masking.
    pub causal: bool,
    /// Sliding-window local attention.
    pub window: Window,
    /// `softcap * tanh(score / softcap)` when positive; `0.0` disables it.
    pub softcap: f32,
    /// Optional ALiBi bias `-slope * |i + sk - sq - j|`.
    pub alibi: Option<AlibiSlopes>,
    /// Valid query rows per batch element for the padded layout.
    pub valid_q_lengths: Option<Vec<usize>>,
    /// Valid key rows per batch element for the padded layout.
    pub valid_k_lengths: Option<Vec<usize>>,
}

impl AttentionParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters for plain causal attention with the default scale.
    pub fn causal() -> Self {
        Self {
            causal: true,
            ..Self::default()
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn with_window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    pub fn with_softcap(mut self, softcap: f32) -> Self {
        self.softcap = softcap;
        self
    }

    pub fn with_alibi(mut self, alibi: AlibiSlopes) -> Self {
        self.alibi = Some(alibi);
        self
    }

    pub fn with_valid_lengths(mut self, q: Vec<usize>, k: Vec<usize>) -> Self {
        self.valid_q_lengths = Some(q);
        self.valid_k_lengths = Some(k);
        self
    }

    /// Default softmax scale for a head dimension.
    pub fn default_scale(head_dim: usize) -> f32 {
        (head_dim as f32).powf(-0.5)
    }

    /// Scale after filling in the default.
    pub fn resolved_scale(&self, head_dim: usize) -> f32 {
        self.scale.unwrap_or_else(|| Self::default_scale(head_dim))
    }

    /// Causal or windowed; decides how queries are rotated on the cache path.
    pub fn is_positional(&self) -> bool {
        self.causal || self.window.is_local()
    }

    pub(crate) fn validate(&self, batch: usize, heads_q: usize) -> Result<()> {
        if !self.softcap.is_finite() || self.softcap < 0.0 {
            return Err(AttentionError::unsupported(format!(
                "softcap must be a finite value >= 0, got {}",
                self.softcap
            )));
        }
        if let Some(scale) = self.scale {
            if !scale.is_finite() {
                return Err(AttentionError::unsupported(format!(
                    "softmax scale must be finite, got {scale}"
                )));
            }
        }
        if let Some(alibi) = &self.alibi {
            alibi.validate(batch, heads_q)?;
        }
        Ok(())
    }
}
