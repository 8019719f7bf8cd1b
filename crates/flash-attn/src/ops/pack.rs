//! Moving data between boundary tensors and padded host buffers.

use candle_core::{DType, Device, Tensor};

use crate::core::Result;
use crate::indexer::SeqLayout;

/// Widen each `dim`-wide row of `data` to `padded` lanes with zeros.
pub(crate) fn pad_rows(data: &[f32], dim: usize, padded: usize) -> Vec<f32> {
    if dim == padded {
        return data.to_vec();
    }
    let mut out = vec![0.0; data.len() / dim * padded];
    for (src, dst) in data.chunks_exact(dim).zip(out.chunks_exact_mut(padded)) {
        dst[..dim].copy_from_slice(src);
    }
    out
}

/// Drop the padding lanes added by [`pad_rows`].
pub(crate) fn truncate_rows(data: &[f32], padded: usize, dim: usize) -> Vec<f32> {
    if dim == padded {
        return data.to_vec();
    }
    data.chunks_exact(padded)
        .flat_map(|row| row[..dim].iter().copied())
        .collect()
}

/// Flatten a tensor to `f32` rows padded to `padded` lanes.
pub(crate) fn pack(tensor: &Tensor, padded: usize) -> Result<Vec<f32>> {
    let dim = tensor.dims().last().copied().unwrap_or(1);
    let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(pad_rows(&data, dim, padded))
}

/// Truncate padded rows and rebuild a tensor of shape `dims`.
pub(crate) fn unpack(data: &[f32], padded: usize, dims: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
    let dim = dims.last().copied().unwrap_or(1);
    let rows = truncate_rows(data, padded, dim);
    Ok(Tensor::from_vec(rows, dims, device)?.to_dtype(dtype)?)
}

/// Token-major `[tokens, heads]` row statistics in the boundary layout:
/// `[batch, heads, seqlen_q]` for padded calls, `[heads, total_q]` for
/// ragged ones.
pub(crate) fn stats_tensor(stats: Vec<f32>, layout: &SeqLayout, heads: usize, device: &Device) -> Result<Tensor> {
    let tensor = match layout {
        SeqLayout::Padded {
            batch, seqlen_q, ..
        } => Tensor::from_vec(stats, (*batch, *seqlen_q, heads), device)?.transpose(1, 2)?,
        SeqLayout::Ragged { .. } => Tensor::from_vec(stats, (layout.total_q(), heads), device)?.t()?,
    };
    Ok(tensor.contiguous()?)
}

/// Inverse of [`stats_tensor`].
pub(crate) fn stats_token_major(tensor: &Tensor, layout: &SeqLayout) -> Result<Vec<f32>> {
    let tensor = tensor.to_dtype(DType::F32)?;
    let token_major = match layout {
        SeqLayout::Padded { .. } => tensor.transpose(1, 2)?,
        SeqLayout::Ragged { .. } => tensor.t()?,
    };
    Ok(token_major.flatten_all()?.to_vec1::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_round_trips() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let padded = pad_rows(&data, 3, 4);
        assert_eq!(padded, vec![1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0]);
        assert_eq!(truncate_rows(&padded, 4, 3), data);
    }

    #[test]
    fn statistics_follow_the_layout() -> anyhow::Result<()> {
        let device = Device::Cpu;
        // Two tokens, three heads: value = 10 * token + head.
        let stats = vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0];

        let padded = SeqLayout::padded(1, 2, 2);
        let tensor = stats_tensor(stats.clone(), &padded, 3, &device)?;
        assert_eq!(tensor.dims(), &[1, 3, 2]);
        assert_eq!(tensor.to_vec3::<f32>()?[0][2], vec![2.0, 12.0]);
        assert_eq!(stats_token_major(&tensor, &padded)?, stats);

        let ragged = SeqLayout::ragged(vec![0, 1, 2], vec![0, 1, 2], 1, 1)?;
        let tensor = stats_tensor(stats.clone(), &ragged, 3, &device)?;
        assert_eq!(tensor.dims(), &[3, 2]);
        assert_eq!(tensor.to_vec2::<f32>()?[1], vec![1.0, 11.0]);
        assert_eq!(stats_token_major(&tensor, &ragged)?, stats);
        Ok(())
    }
}
