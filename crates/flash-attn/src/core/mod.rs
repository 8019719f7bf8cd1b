//! Core traits and types shared across attention implementations.
//!
//! Padded inputs use the layout `[batch, seq_len, n_heads, head_dim]` and
//! ragged inputs `[total_tokens, n_heads, head_dim]`. Key/value tensors may
//! carry fewer heads than the queries as long as the query head count is a
//! multiple of it. Reductions always run in `f32`.

pub mod config;
pub mod engine;
pub mod errors;
pub mod params;

use candle_core::Tensor;

pub use config::{EngineConfig, PrecisionPolicy, MAX_HEAD_DIM, MAX_SPLITS};
pub use engine::{Capabilities, FlashEngine};
pub use errors::{AttentionError, Result};
pub use params::{AlibiSlopes, AttentionParams, Window};

/// Output and row statistics of one attention call.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[batch, seq_q, heads_q, head_dim]`.
    pub out: Tensor,
    /// `[batch, heads_q, seq_q]`, `f32`.
    pub lse: Tensor,
}

/// Unified interface for padded attention kernels.
///
/// * `q` is `[batch, seq_q, heads_q, head_dim]`; `k` and `v` are
///   `[batch, seq_k, heads_kv, head_dim]` with `heads_q % heads_kv == 0`.
/// * Rows without any visible key produce zeros and a log-sum-exp of
///   [`LSE_MASKED`](crate::forward::LSE_MASKED).
pub trait AttentionKernel {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        params: &AttentionParams,
    ) -> Result<AttentionOutput>;
}
