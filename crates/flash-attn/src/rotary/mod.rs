//! Rotary position embeddings applied to head vectors.
//!
//! A [`RotaryTable`] holds `[positions, rotary_dim / 2]` cosine and sine
//! values, either supplied by the caller or built from a base `theta`. Only
//! the leading `rotary_dim` lanes of a head vector are rotated; the remainder
//! is passed through untouched.
//!
//! Two pairings are supported:
//! * [`RotaryLayout::Interleaved`] rotates lanes `(2i, 2i + 1)`;
//! * [`RotaryLayout::HalfSplit`] rotates lanes `(i, i + rotary_dim / 2)`
//!   (GPT-NeoX style).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::core::{AttentionError, Result};

const TABLE_CACHE_CAPACITY: usize = 8;

/// Lane pairing used by the rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RotaryLayout {
    #[default]
    Interleaved,
    HalfSplit,
}

/// Precomputed cosine/sine table.
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryTable {
    cos: Vec<f32>,
    sin: Vec<f32>,
    positions: usize,
    half_dim: usize,
}

impl RotaryTable {
    /// Read caller supplied `[positions, rotary_dim / 2]` tables.
    pub fn from_tensors(cos: &Tensor, sin: &Tensor) -> Result<Self> {
        let (positions, half_dim) = cos.dims2().map_err(|_| {
            AttentionError::shape(format!(
                "rotary cos must have shape [positions, rotary_dim / 2], got {:?}",
                cos.dims()
            ))
        })?;
        if sin.dims() != cos.dims() {
            return Err(AttentionError::shape(format!(
                "rotary sin {:?} and cos {:?} differ in shape",
                sin.dims(),
                cos.dims()
            )));
        }
        if cos.dtype() != sin.dtype() {
            return Err(AttentionError::dtype(format!(
                "rotary cos is {:?} but sin is {:?}",
                cos.dtype(),
                sin.dtype()
            )));
        }
        if half_dim == 0 {
            return Err(AttentionError::alignment("rotary_dim must be non-zero"));
        }
        let cos = cos.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let sin = sin.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self {
            cos,
            sin,
            positions,
            half_dim,
        })
    }

    /// Build the standard RoPE table `angle = pos * theta^(-2i / rotary_dim)`.
    pub fn build(positions: usize, rotary_dim: usize, theta: f32) -> Result<Self> {
        if rotary_dim == 0 || rotary_dim % 2 != 0 {
            return Err(AttentionError::alignment(format!(
                "rotary_dim must be even and non-zero, got {rotary_dim}"
            )));
        }
        let half_dim = rotary_dim / 2;
        let base = theta as f64;
        let inv_freqs: Vec<f64> = (0..half_dim)
            .map(|idx| base.powf(-((2 * idx) as f64) / rotary_dim as f64))
            .collect();

        let mut cos = Vec::with_capacity(positions * half_dim);
        let mut sin = Vec::with_capacity(positions * half_dim);
        for pos in 0..positions {
            for &inv_freq in &inv_freqs {
                let angle = pos as f64 * inv_freq;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }
        Ok(Self {
            cos,
            sin,
            positions,
            half_dim,
        })
    }

    /// Shared, bounded cache of built tables keyed by geometry and `theta`.
    pub fn cached(positions: usize, rotary_dim: usize, theta: f32) -> Result<Arc<Self>> {
        let key = format!("pos={positions};rot={rotary_dim};theta={theta:.6}");
        let cache = table_cache();
        {
            let mut guard = cache
                .lock()
                .map_err(|_| AttentionError::unsupported("rotary table cache poisoned"))?;
            if let Some(table) = guard.get(&key) {
                log::debug!("rotary table cache hit: {key}");
                return Ok(table);
            }
        }
        log::debug!("rotary table cache miss: {key}");
        let table = Arc::new(Self::build(positions, rotary_dim, theta)?);
        let mut guard = cache
            .lock()
            .map_err(|_| AttentionError::unsupported("rotary table cache poisoned"))?;
        guard.insert(key, table.clone());
        Ok(table)
    }

    pub fn positions(&self) -> usize {
        self.positions
    }

    pub fn rotary_dim(&self) -> usize {
        self.half_dim * 2
    }

    /// Check the table can rotate `head_dim` vectors up to position
    /// `max_position` (exclusive).
    pub fn validate_for(&self, head_dim: usize, max_position: usize) -> Result<()> {
        if self.rotary_dim() > head_dim {
            return Err(AttentionError::alignment(format!(
                "rotary_dim {} exceeds head_dim {head_dim}",
                self.rotary_dim()
            )));
        }
        if max_position > self.positions {
            return Err(AttentionError::capacity(format!(
                "rotary table covers {} positions, {max_position} required",
                self.positions
            )));
        }
        Ok(())
    }

    /// Rotate the leading `rotary_dim` lanes of `x` in place.
    ///
    /// Callers validate `position` and the vector length up front with
    /// [`RotaryTable::validate_for`].
    #[inline]
    pub fn rotate(&self, x: &mut [f32], position: usize, layout: RotaryLayout) {
        let row = position * self.half_dim;
        let cos = &self.cos[row..row + self.half_dim];
        let sin = &self.sin[row..row + self.half_dim];
        for i in 0..self.half_dim {
            let (a, b) = match layout {
                RotaryLayout::Interleaved => (2 * i, 2 * i + 1),
                RotaryLayout::HalfSplit => (i, i + self.half_dim),
            };
            let (x0, x1) = (x[a], x[b]);
            x[a] = x0 * cos[i] - x1 * sin[i];
            x[b] = x0 * sin[i] + x1 * cos[i];
        }
    }
}

/// Rotate a `[batch, seq, heads, head_dim]` tensor, token `t` of every batch
/// element at position `start + t`.
pub fn apply_rotary(
    x: &Tensor,
    table: &RotaryTable,
    start: usize,
    layout: RotaryLayout,
) -> Result<Tensor> {
    let (batch, seq, heads, head_dim) = x.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "rotary input must have shape [batch, seq, heads, head_dim], got {:?}",
            x.dims()
        ))
    })?;
    table.validate_for(head_dim, start + seq)?;
    let dtype = x.dtype();
    let mut data = x.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    for (row_idx, row) in data.chunks_mut(head_dim).enumerate() {
        let token = (row_idx / heads) % seq;
        table.rotate(row, start + token, layout);
    }
    let rotated = Tensor::from_vec(data, (batch, seq, heads, head_dim), x.device())?;
    Ok(rotated.to_dtype(dtype)?)
}

struct TableCache {
    capacity: usize,
    order: Vec<String>,
    entries: HashMap<String, Arc<RotaryTable>>,
}

impl TableCache {
    fn get(&mut self, key: &str) -> Option<Arc<RotaryTable>> {
        let table = self.entries.get(key)?.clone();
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let owned = self.order.remove(pos);
            self.order.push(owned);
        }
        Some(table)
    }

    fn insert(&mut self, key: String, table: Arc<RotaryTable>) {
        if self.entries.insert(key.clone(), table).is_some() {
            return;
        }
        self.order.push(key);
        if self.order.len() > self.capacity {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
    }
}

fn table_cache() -> &'static Mutex<TableCache> {
    static CACHE: OnceLock<Mutex<TableCache>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(TableCache {
            capacity: TABLE_CACHE_CAPACITY,
            order: Vec::with_capacity(TABLE_CACHE_CAPACITY + 1),
            entries: HashMap::with_capacity(TABLE_CACHE_CAPACITY + 1),
        })
    })
}
