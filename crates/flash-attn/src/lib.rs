//! Tiled, numerically stable scaled-dot-product attention.
//!
//! The crate computes attention over `candle` tensors with layout
//! `[batch, seq_len, n_heads, head_dim]` (padded) or
//! `[total_tokens, n_heads, head_dim]` (ragged). Inputs may be bf16, f16 or
//! f32; reductions always run in `f32` and outputs follow the engine's
//! [`PrecisionPolicy`].
//!
//! The forward pass sweeps key tiles with an online softmax and never builds
//! the full score matrix. It returns the per-row log-sum-exp, which is all
//! the backward pass needs to recompute probabilities tile by tile. Key/value
//! heads are broadcast to groups of query heads (GQA/MQA).
//!
//! Decoding goes through [`FlashEngine::forward_with_cache`], which appends
//! new tokens to a caller-owned [`KvCache`] (directly indexed or paged),
//! optionally applies rotary embeddings, and splits long key ranges across
//! workers before merging the partial results.
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use flash_attn::{AttentionParams, EngineConfig, FlashEngine};
//!
//! # fn main() -> flash_attn::Result<()> {
//! let engine = FlashEngine::new(EngineConfig::default(), &Device::Cpu)?;
//! let q = Tensor::zeros((1, 16, 8, 64), DType::F32, &Device::Cpu)?;
//! let kv = Tensor::zeros((1, 16, 2, 64), DType::F32, &Device::Cpu)?;
//! let fwd = engine.forward(&q, &kv, &kv, &AttentionParams::causal())?;
//! let grads = engine.backward(&fwd.out.ones_like()?, &fwd.context)?;
//! # let _ = grads;
//! # Ok(())
//! # }
//! ```

mod backward;
pub mod context;
pub mod core;
pub mod forward;
pub mod indexer;
pub mod kv_cache;
pub mod masks;
pub mod ops;
pub mod reference;
pub mod rotary;
pub mod split;

pub use context::{SavedContext, SavedTensor};
pub use core::{
    AlibiSlopes, AttentionError, AttentionKernel, AttentionOutput, AttentionParams, EngineConfig,
    FlashEngine, PrecisionPolicy, Result, Window,
};
pub use forward::LSE_MASKED;
pub use indexer::SeqLayout;
pub use kv_cache::{BlockTable, CacheLayout, CacheSeqlens, KvCache};
pub use ops::{CacheOutput, CacheRequest, ForwardOutput, Gradients};
pub use reference::DenseAttention;
pub use rotary::{RotaryLayout, RotaryTable};
