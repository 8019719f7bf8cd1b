//! Masking and score-shaping utilities.
//!
//! [`MaskGeometry`] and [`ScoreModifiers`] are evaluated on the fly by the
//! tiled kernels. The additive builders produce dense `f32` tensors shaped
//! `[batch, num_heads, q_len, k_len]` holding `0.0` (keep) or
//! `f32::NEG_INFINITY` (discard) for the dense reference path.

pub mod causal;
pub mod geometry;
pub mod modifiers;
pub mod padding;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::{build_causal_mask, build_geometry_mask};
pub use geometry::MaskGeometry;
pub use modifiers::ScoreModifiers;
pub(crate) use modifiers::dot;
pub use padding::padding_mask_from_lengths;
