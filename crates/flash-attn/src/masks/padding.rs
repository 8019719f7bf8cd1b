//! Builders for padding masks used to drop padded keys.
//!
//! All padding masks share the dtype and layout described in
//! [`super::MASK_DTYPE`](super::MASK_DTYPE).

use candle_core::{Device, Result, Tensor};

/// Construct padding masks from per-batch valid key lengths.
///
/// Keys at or beyond `key_lengths[b]` are masked for every query row of
/// batch element `b`. Lengths above `k_len` are clamped.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let batch = key_lengths.len();
    let mut data = Vec::with_capacity(batch * num_heads * q_len * k_len);

    for &valid in key_lengths {
        let valid = valid.min(k_len);
        let mut row = vec![0f32; k_len];
        row[valid..].fill(f32::NEG_INFINITY);
        for _ in 0..num_heads * q_len {
            data.extend_from_slice(&row);
        }
    }

    Tensor::from_vec(data, (batch, num_heads, q_len, k_len), device)
}
