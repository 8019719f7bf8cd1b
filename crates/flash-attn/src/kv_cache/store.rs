//! Host-resident key/value cache storage.
//!
//! The caller owns a [`KvCache`] across decode steps and lends it mutably to
//! [`FlashEngine::forward_with_cache`](crate::core::FlashEngine::forward_with_cache),
//! which writes new tokens in place. Values are held in `f32` but rounded to
//! the cache element type on write, so attention over the live cache matches
//! attention over its tensor snapshot.

use candle_core::{DType, Device, Tensor};

use super::layout::CacheLayout;
use crate::core::{AttentionError, Result};

/// Persistent key/value buffers shaped `[slots, slot_len, heads, head_dim]`.
#[derive(Debug, Clone)]
pub struct KvCache {
    layout: CacheLayout,
    dtype: DType,
    device: Device,
    keys: Vec<f32>,
    values: Vec<f32>,
}

impl KvCache {
    /// Allocate a zero-filled cache.
    pub fn zeros(layout: CacheLayout, dtype: DType, device: &Device) -> Result<Self> {
        check_dtype(dtype)?;
        if layout.heads == 0 || layout.head_dim == 0 || layout.slot_len == 0 {
            return Err(AttentionError::shape(format!(
                "cache layout must have non-zero dimensions, got {:?}",
                layout.dims()
            )));
        }
        log::info!(
            "kv-cache init: slots={} slot_len={} heads={} head_dim={} dtype={:?}",
            layout.slots,
            layout.slot_len,
            layout.heads,
            layout.head_dim,
            dtype
        );
        Ok(Self {
            layout,
            dtype,
            device: device.clone(),
            keys: vec![0.0; layout.numel()],
            values: vec![0.0; layout.numel()],
        })
    }

    /// Copy existing `[slots, slot_len, heads, head_dim]` cache tensors.
    pub fn from_tensors(k_cache: &Tensor, v_cache: &Tensor) -> Result<Self> {
        let (slots, slot_len, heads, head_dim) = k_cache.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "k_cache must have shape [slots, slot_len, heads, head_dim], got {:?}",
                k_cache.dims()
            ))
        })?;
        if v_cache.dims() != k_cache.dims() {
            return Err(AttentionError::shape(format!(
                "v_cache {:?} must match k_cache {:?}",
                v_cache.dims(),
                k_cache.dims()
            )));
        }
        if v_cache.dtype() != k_cache.dtype() {
            return Err(AttentionError::dtype(format!(
                "k_cache is {:?} but v_cache is {:?}",
                k_cache.dtype(),
                v_cache.dtype()
            )));
        }
        let mut cache = Self::zeros(
            CacheLayout {
                slots,
                slot_len,
                heads,
                head_dim,
            },
            k_cache.dtype(),
            k_cache.device(),
        )?;
        cache.keys = k_cache.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        cache.values = v_cache.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(cache)
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Current keys as a tensor of the cache dtype.
    pub fn keys(&self) -> Result<Tensor> {
        self.to_tensor(&self.keys)
    }

    /// Current values as a tensor of the cache dtype.
    pub fn values(&self) -> Result<Tensor> {
        self.to_tensor(&self.values)
    }

    fn to_tensor(&self, data: &[f32]) -> Result<Tensor> {
        let tensor = Tensor::from_slice(data, self.layout.dims(), &self.device)?;
        Ok(tensor.to_dtype(self.dtype)?)
    }

    #[inline]
    pub(crate) fn key_row(&self, slot: usize, pos: usize, head: usize) -> &[f32] {
        let start = self.layout.offset(slot, pos, head);
        &self.keys[start..start + self.layout.head_dim]
    }

    #[inline]
    pub(crate) fn value_row(&self, slot: usize, pos: usize, head: usize) -> &[f32] {
        let start = self.layout.offset(slot, pos, head);
        &self.values[start..start + self.layout.head_dim]
    }

    /// Round host values to the cache element type, keeping them in `f32`.
    pub(crate) fn round_to_storage(&self, data: Vec<f32>) -> Result<Vec<f32>> {
        if self.dtype == DType::F32 {
            return Ok(data);
        }
        let len = data.len();
        let rounded = Tensor::from_vec(data, len, &Device::Cpu)?
            .to_dtype(self.dtype)?
            .to_dtype(DType::F32)?;
        Ok(rounded.to_vec1::<f32>()?)
    }

    pub(crate) fn write_row(
        &mut self,
        slot: usize,
        pos: usize,
        head: usize,
        key: &[f32],
        value: &[f32],
    ) {
        let start = self.layout.offset(slot, pos, head);
        let end = start + self.layout.head_dim;
        self.keys[start..end].copy_from_slice(key);
        self.values[start..end].copy_from_slice(value);
    }
}

fn check_dtype(dtype: DType) -> Result<()> {
    if matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
        Ok(())
    } else {
        Err(AttentionError::dtype(format!(
            "cache dtype must be f32, f16 or bf16, got {dtype:?}"
        )))
    }
}
