//! Untiled attention built from dense tensor ops.
//!
//! The full `[batch, heads, seqlen_q, seqlen_k]` score matrix is
//! materialized, so this path is only suitable for small problems. It is the
//! ground truth the tiled engine is checked against.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::softmax_last_dim;

use crate::core::{AttentionError, AttentionKernel, AttentionOutput, AttentionParams, Result};
use crate::forward::LSE_MASKED;
use crate::masks::{MaskGeometry, MASK_DTYPE};

/// Scores at or below this value count as masked.
const MASKED_SCORE: f64 = -1e30;

/// Output of [`DenseAttention::attend_with_mask`].
#[derive(Debug, Clone)]
pub struct DenseOutput {
    /// `[batch, seqlen_q, heads_q, head_dim]` in the query dtype.
    pub out: Tensor,
    /// `[batch, heads_q, seqlen_q]`, `f32`.
    pub lse: Tensor,
    /// Normalized probabilities `[batch, heads_q, seqlen_q, seqlen_k]`, `f32`;
    /// fully masked rows are zero.
    pub probs: Tensor,
}

/// Dense softmax attention over padded `[batch, seq, heads, head_dim]`
/// tensors.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseAttention;

impl DenseAttention {
    pub fn new() -> Self {
        Self
    }

    /// Attend with an optional extra additive mask of shape
    /// `[batch, 1 | heads_q, seqlen_q, seqlen_k]` holding `0` or `-inf`.
    pub fn attend_with_mask(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        params: &AttentionParams,
        mask: Option<&Tensor>,
    ) -> Result<DenseOutput> {
        let (batch, seqlen_q, heads_q, head_dim) = q.dims4().map_err(|_| {
            AttentionError::shape("q must have shape [batch, seqlen_q, heads, head_dim]")
        })?;
        let (kb, seqlen_k, heads_kv, kd) = k.dims4().map_err(|_| {
            AttentionError::shape("k must have shape [batch, seqlen_k, heads_kv, head_dim]")
        })?;
        if kb != batch || kd != head_dim || v.dims() != k.dims() {
            return Err(AttentionError::shape(format!(
                "incompatible shapes: q {:?}, k {:?}, v {:?}",
                q.dims(),
                k.dims(),
                v.dims()
            )));
        }
        if heads_kv == 0 || heads_q % heads_kv != 0 {
            return Err(AttentionError::shape(format!(
                "query heads ({heads_q}) must be a multiple of key/value heads ({heads_kv})"
            )));
        }
        params.validate(batch, heads_q)?;
        let device = q.device();
        let shape = (batch, heads_q, seqlen_q, seqlen_k);

        let heads_first = |x: &Tensor| -> Result<Tensor> {
            Ok(x.to_dtype(DType::F32)?.transpose(1, 2)?.contiguous()?)
        };
        let q32 = heads_first(q)?;
        let (mut k32, mut v32) = (heads_first(k)?, heads_first(v)?);
        if heads_kv != heads_q {
            let group = heads_q / heads_kv;
            let index: Vec<u32> = (0..heads_q).map(|h| (h / group) as u32).collect();
            let index = Tensor::new(index.as_slice(), device)?;
            k32 = k32.index_select(&index, 1)?;
            v32 = v32.index_select(&index, 1)?;
        }

        let scale = params.resolved_scale(head_dim) as f64;
        let mut scores = q32.matmul(&k32.t()?.contiguous()?)?.affine(scale, 0.0)?;
        if params.softcap > 0.0 {
            let cap = params.softcap as f64;
            scores = scores.affine(1.0 / cap, 0.0)?.tanh()?.affine(cap, 0.0)?;
        }
        scores = scores.add(&score_bias(params, shape, device)?)?;
        if let Some(mask) = mask {
            if mask.dtype() != MASK_DTYPE {
                return Err(AttentionError::dtype(format!(
                    "mask expects dtype {MASK_DTYPE:?}, got {:?}",
                    mask.dtype()
                )));
            }
            let (mb, mh, mq, mk) = mask.dims4().map_err(|_| {
                AttentionError::shape("mask must have shape [batch, heads|1, q_len, k_len]")
            })?;
            if mb != batch || mq != seqlen_q || mk != seqlen_k || (mh != 1 && mh != heads_q) {
                return Err(AttentionError::shape(format!(
                    "mask shape {:?} does not broadcast to {shape:?}",
                    mask.dims()
                )));
            }
            scores = scores.broadcast_add(mask)?;
        }

        let scores = scores.maximum(MASKED_SCORE)?;
        let row_max = scores.max_keepdim(D::Minus1)?;
        let keep = row_max.gt(MASKED_SCORE * 0.5)?;
        let probs = softmax_last_dim(&scores)?.broadcast_mul(&keep.to_dtype(DType::F32)?)?;
        let lse = scores
            .broadcast_sub(&row_max)?
            .exp()?
            .sum_keepdim(D::Minus1)?
            .log()?
            .add(&row_max)?;
        let masked = Tensor::full(LSE_MASKED, lse.shape(), device)?;
        let lse = keep.where_cond(&lse, &masked)?.squeeze(3)?;

        let out = probs
            .matmul(&v32)?
            .transpose(1, 2)?
            .contiguous()?
            .to_dtype(q.dtype())?;
        Ok(DenseOutput { out, lse, probs })
    }
}

/// ALiBi bias plus causal, window and valid-length masking as one additive
/// `[batch, heads, seqlen_q, seqlen_k]` tensor.
fn score_bias(
    params: &AttentionParams,
    (batch, heads, seqlen_q, seqlen_k): (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let valid = |lengths: &Option<Vec<usize>>, b: usize, full: usize| {
        lengths.as_ref().map_or(full, |l| l[b].min(full))
    };
    let mut bias = vec![f32::NEG_INFINITY; batch * heads * seqlen_q * seqlen_k];
    for b in 0..batch {
        let valid_q = valid(&params.valid_q_lengths, b, seqlen_q);
        let valid_k = valid(&params.valid_k_lengths, b, seqlen_k);
        let geometry = MaskGeometry::new(valid_q, valid_k, params.causal, params.window);
        for h in 0..heads {
            let slope = params.alibi.as_ref().map(|alibi| alibi.slope(b, h));
            for i in 0..valid_q {
                let Some(keys) = geometry.key_bounds(i) else {
                    continue;
                };
                let row = ((b * heads + h) * seqlen_q + i) * seqlen_k;
                for j in keys {
                    let distance = (i as i64 + valid_k as i64 - valid_q as i64 - j as i64).abs();
                    bias[row + j] = slope.map_or(0.0, |s| -s * distance as f32);
                }
            }
        }
    }
    Ok(Tensor::from_vec(bias, (batch, heads, seqlen_q, seqlen_k), device)?)
}

impl AttentionKernel for DenseAttention {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, params: &AttentionParams) -> Result<AttentionOutput> {
        let DenseOutput { out, lse, .. } = self.attend_with_mask(q, k, v, params, None)?;
        Ok(AttentionOutput { out, lse })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AlibiSlopes;
    use crate::masks::padding_mask_from_lengths;

    fn build_inputs(device: &Device) -> anyhow::Result<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| ((i * 37 % 64) as f32) * 0.02 - 0.6).collect();
        let q = Tensor::from_vec(data.clone(), (1, 4, 2, 8), device)?;
        let k = Tensor::from_vec(data.iter().rev().copied().collect::<Vec<_>>(), (1, 4, 2, 8), device)?;
        let v = Tensor::from_vec(data, (1, 4, 2, 8), device)?;
        Ok((q, k, v))
    }

    /// Row-by-row softmax over `[batch, seq, heads, dim]` host data.
    fn naive_attention(q: &Tensor, k: &Tensor, v: &Tensor, params: &AttentionParams) -> anyhow::Result<Vec<f32>> {
        let (batch, q_len, heads, head_dim) = q.dims4()?;
        let (_, k_len, kv_heads, _) = k.dims4()?;
        let group = heads / kv_heads;
        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let geometry = MaskGeometry::new(q_len, k_len, params.causal, params.window);
        let scale = params.resolved_scale(head_dim);
        let mut output = vec![0f32; batch * q_len * heads * head_dim];

        for b in 0..batch {
            for h in 0..heads {
                let kv = h / group;
                for i in 0..q_len {
                    let qi = ((b * q_len + i) * heads + h) * head_dim;
                    let mut row = vec![f32::NEG_INFINITY; k_len];
                    for (j, slot) in row.iter_mut().enumerate() {
                        if !geometry.allows(i, j) {
                            continue;
                        }
                        let kj = ((b * k_len + j) * kv_heads + kv) * head_dim;
                        let dot: f32 = (0..head_dim).map(|d| q_vec[qi + d] * k_vec[kj + d]).sum();
                        let mut score = dot * scale;
                        if params.softcap > 0.0 {
                            score = params.softcap * (score / params.softcap).tanh();
                        }
                        if let Some(alibi) = &params.alibi {
                            let distance = (i as i64 + k_len as i64 - q_len as i64 - j as i64).abs();
                            score -= alibi.slope(b, h) * distance as f32;
                        }
                        *slot = score;
                    }
                    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    if max == f32::NEG_INFINITY {
                        continue;
                    }
                    let weights: Vec<f32> = row.iter().map(|s| (s - max).exp()).collect();
                    let denom: f32 = weights.iter().sum();
                    for (j, w) in weights.iter().enumerate() {
                        let vj = ((b * k_len + j) * kv_heads + kv) * head_dim;
                        for d in 0..head_dim {
                            output[qi + d] += w / denom * v_vec[vj + d];
                        }
                    }
                }
            }
        }
        Ok(output)
    }

    fn max_diff(a: &Tensor, b: &[f32]) -> anyhow::Result<f32> {
        let a = a.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(a.iter().zip(b).fold(0.0f32, |m, (x, y)| m.max((x - y).abs())))
    }

    #[test]
    fn dense_attention_matches_naive() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        for params in [
            AttentionParams::new(),
            AttentionParams::causal(),
            AttentionParams::new()
                .with_softcap(0.8)
                .with_alibi(AlibiSlopes::PerHead(vec![0.3, 0.7])),
        ] {
            let output = DenseAttention.attend(&q, &k, &v, &params)?;
            let expected = naive_attention(&q, &k, &v, &params)?;
            assert!(max_diff(&output.out, &expected)? < 1e-5, "{params:?}");
        }
        Ok(())
    }

    #[test]
    fn grouped_heads_broadcast_key_values() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let k1 = k.narrow(2, 0, 1)?;
        let v1 = v.narrow(2, 0, 1)?;
        let params = AttentionParams::causal();
        let output = DenseAttention.attend(&q, &k1, &v1, &params)?;
        let expected = naive_attention(&q, &k1, &v1, &params)?;
        assert!(max_diff(&output.out, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 4, 2, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 5, 2, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 4, 2, 8), DType::F32, &device).unwrap();
        let err = DenseAttention.attend(&q, &k, &v, &AttentionParams::new()).unwrap_err();
        assert!(matches!(err, AttentionError::ShapeMismatch { .. }));

        let k = Tensor::zeros((1, 4, 3, 8), DType::F32, &device).unwrap();
        let err = DenseAttention.attend(&q, &k, &k, &AttentionParams::new()).unwrap_err();
        assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
    }

    #[test]
    fn fully_masked_rows_are_zero_with_sentinel_lse() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::rand(-1.0f32, 1.0, (1, 5, 1, 4), &device)?;
        let k = Tensor::rand(-1.0f32, 1.0, (1, 2, 1, 4), &device)?;
        let output = DenseAttention.attend_with_mask(&q, &k, &k, &AttentionParams::causal(), None)?;
        let lse = output.lse.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(&lse[..3], &[LSE_MASKED; 3]);
        assert!(lse[3..].iter().all(|x| x.is_finite()));
        let sums = output.probs.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        for (row, sum) in sums.iter().enumerate() {
            let expected = if row < 3 { 0.0 } else { 1.0 };
            assert!((sum - expected).abs() < 1e-5);
        }
        let out = output.out.flatten_all()?.to_vec1::<f32>()?;
        assert!(out[..12].iter().all(|x| *x == 0.0));
        Ok(())
    }

    #[test]
    fn padding_mask_hides_trailing_keys() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = padding_mask_from_lengths(&device, &[3], 1, 4, 4)?;
        let masked = DenseAttention.attend_with_mask(&q, &k, &v, &AttentionParams::new(), Some(&mask))?;
        let params = AttentionParams::new().with_valid_lengths(vec![4], vec![3]);
        let by_length = DenseAttention.attend_with_mask(&q, &k, &v, &params, None)?;
        let expected = by_length.out.flatten_all()?.to_vec1::<f32>()?;
        assert!(max_diff(&masked.out, &expected)? < 1e-6);
        let probs = masked.probs.flatten_all()?.to_vec1::<f32>()?;
        assert!(probs.chunks(4).all(|row| row[3] == 0.0));
        Ok(())
    }

    #[test]
    fn dtype_matrix() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let params = AttentionParams::causal();
        let reference = naive_attention(&q, &k, &v, &params)?;
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let out = DenseAttention.attend(&q.to_dtype(dtype)?, &k.to_dtype(dtype)?, &v.to_dtype(dtype)?, &params)?;
            assert_eq!(out.out.dtype(), dtype);
            let max = max_diff(&out.out, &reference)?;
            assert!(max < 5e-2, "dtype {dtype:?} diverged by {max}");
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 4, 1, 4), &device)?;
        let k = Tensor::full(-10_000.0f32, (1, 4, 1, 4), &device)?;
        let v = Tensor::ones((1, 4, 1, 4), DType::F32, &device)?;
        let out = DenseAttention.attend(&q, &k, &v, &AttentionParams::new())?;
        let values = out.out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|value| value.is_finite()));
        Ok(())
    }
}
