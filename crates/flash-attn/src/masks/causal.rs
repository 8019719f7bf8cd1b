//! Builders for additive causal and local attention masks.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and shape
//! `[batch, num_heads, q_len, k_len]`. Entries are `0.0` where attention is
//! permitted and `f32::NEG_INFINITY` otherwise.

use candle_core::{Device, Result, Tensor};

use super::geometry::MaskGeometry;
use crate::core::Window;

/// Construct a bottom-right aligned causal mask.
///
/// When `k_len > q_len`, queries align with the most recent `q_len` keys;
/// when `q_len > k_len`, the leading `q_len - k_len` rows are fully masked.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let geometry = MaskGeometry::new(q_len, k_len, true, Window::UNBOUNDED);
    build_geometry_mask(device, batch, num_heads, &geometry)
}

/// Construct a mask for an arbitrary causal/window combination.
pub fn build_geometry_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    geometry: &MaskGeometry,
) -> Result<Tensor> {
    let (q_len, k_len) = (geometry.seqlen_q, geometry.seqlen_k);
    let mut plane = vec![f32::NEG_INFINITY; q_len * k_len];
    for q in 0..q_len {
        if let Some(bounds) = geometry.key_bounds(q) {
            plane[q * k_len + bounds.start..q * k_len + bounds.end].fill(0.0);
        }
    }

    let mut data = Vec::with_capacity(batch * num_heads * plane.len());
    for _ in 0..batch * num_heads {
        data.extend_from_slice(&plane);
    }
    Tensor::from_vec(data, (batch, num_heads, q_len, k_len), device)
}
