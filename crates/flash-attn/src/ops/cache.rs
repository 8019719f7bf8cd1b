//! Decode-time attention against a persistent key/value cache.

use std::sync::Arc;

use candle_core::{DType, Tensor};

use super::pack::{pad_rows, stats_tensor, unpack};
use super::{head_counts, Gradients};
use crate::core::{AttentionError, AttentionParams, FlashEngine, Result};
use crate::forward::{HeadView, Problem};
use crate::indexer::{SeqLayout, SequenceSpan};
use crate::kv_cache::{BlockTable, CachePlan, CacheSeqlens, KvCache};
use crate::rotary::{RotaryLayout, RotaryTable};
use crate::split::{self, choose_num_splits};

/// Arguments of [`FlashEngine::forward_with_cache`] besides the queries and
/// the cache.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub k_new: Option<Tensor>,
    pub v_new: Option<Tensor>,
    pub rotary: Option<(Arc<RotaryTable>, RotaryLayout)>,
    pub cache_seqlens: CacheSeqlens,
    pub cache_batch_idx: Option<Vec<usize>>,
    pub cache_leftpad: Option<Vec<usize>>,
    pub block_table: Option<BlockTable>,
    pub params: AttentionParams,
    /// `0` picks a split count automatically, `1` disables splitting.
    pub num_splits: usize,
    pub return_lse: bool,
}

impl Default for CacheRequest {
    fn default() -> Self {
        Self::new(AttentionParams::default())
    }
}

impl CacheRequest {
    pub fn new(params: AttentionParams) -> Self {
        Self {
            k_new: None,
            v_new: None,
            rotary: None,
            cache_seqlens: CacheSeqlens::Uniform(0),
            cache_batch_idx: None,
            cache_leftpad: None,
            block_table: None,
            params,
            num_splits: 1,
            return_lse: false,
        }
    }

    /// Append `[batch, seqlen_new, heads_kv, head_dim]` keys and values
    /// before attending.
    pub fn with_new_tokens(mut self, k_new: Tensor, v_new: Tensor) -> Self {
        self.k_new = Some(k_new);
        self.v_new = Some(v_new);
        self
    }

    pub fn with_rotary(mut self, table: impl Into<Arc<RotaryTable>>, layout: RotaryLayout) -> Self {
        self.rotary = Some((table.into(), layout));
        self
    }

    pub fn with_seqlens(mut self, seqlens: impl Into<CacheSeqlens>) -> Self {
        self.cache_seqlens = seqlens.into();
        self
    }

    pub fn with_batch_idx(mut self, batch_idx: Vec<usize>) -> Self {
        self.cache_batch_idx = Some(batch_idx);
        self
    }

    pub fn with_leftpad(mut self, leftpad: Vec<usize>) -> Self {
        self.cache_leftpad = Some(leftpad);
        self
    }

    pub fn with_block_table(mut self, table: BlockTable) -> Self {
        self.block_table = Some(table);
        self
    }

    pub fn with_num_splits(mut self, num_splits: usize) -> Self {
        self.num_splits = num_splits;
        self
    }

    pub fn with_lse(mut self, return_lse: bool) -> Self {
        self.return_lse = return_lse;
        self
    }
}

/// Result of a cache-augmented forward call.
#[derive(Debug, Clone)]
pub struct CacheOutput {
    /// `[batch, seqlen_q, heads_q, head_dim]`.
    pub out: Tensor,
    /// `[batch, heads_q, seqlen_q]`, present when requested.
    pub lse: Option<Tensor>,
    /// Split count actually used.
    pub num_splits: usize,
}

impl CacheOutput {
    /// The cache path keeps no saved context and has no gradient.
    pub fn backward(&self, _d_out: &Tensor) -> Result<Gradients> {
        Err(AttentionError::unsupported(
            "backward is not defined for forward_with_cache",
        ))
    }
}

fn dims4(name: &str, tensor: &Tensor) -> Result<(usize, usize, usize, usize)> {
    tensor.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "{name} must have shape [batch, seq, heads, head_dim], got {:?}",
            tensor.dims()
        ))
    })
}

impl FlashEngine {
    /// Append new tokens to `cache`, then attend `q` to everything cached.
    ///
    /// All validation happens before the cache is written, so an error
    /// leaves `cache` untouched. Queries are rotated at absolute positions
    /// `cache_seqlens[b] + t` for causal or windowed attention and at
    /// `cache_seqlens[b]` otherwise.
    pub fn forward_with_cache(&self, q: &Tensor, cache: &mut KvCache, request: CacheRequest) -> Result<CacheOutput> {
        let (batch, seqlen_q, heads_q, head_dim) = dims4("q", q)?;
        let layout = *cache.layout();
        if layout.head_dim != head_dim {
            return Err(AttentionError::shape(format!(
                "cache head dim {} does not match q head dim {head_dim}",
                layout.head_dim
            )));
        }
        head_counts(heads_q, layout.heads)?;

        let mut inputs = vec![("q", q)];
        let new_tokens = match (&request.k_new, &request.v_new) {
            (Some(k_new), Some(v_new)) => {
                let dims = dims4("k_new", k_new)?;
                super::same_dims("v_new", v_new, k_new.dims())?;
                if dims.0 != batch || dims.2 != layout.heads || dims.3 != head_dim {
                    return Err(AttentionError::shape(format!(
                        "k_new {:?} does not match batch {batch}, {} cache heads and head dim {head_dim}",
                        k_new.dims(),
                        layout.heads
                    )));
                }
                inputs.push(("k_new", k_new));
                inputs.push(("v_new", v_new));
                Some((k_new, v_new, dims.1))
            }
            (None, None) => None,
            _ => {
                return Err(AttentionError::shape(
                    "k_new and v_new must be supplied together",
                ))
            }
        };
        let dtype = self.check_inputs(&inputs)?;
        if cache.dtype() != dtype {
            return Err(AttentionError::dtype(format!(
                "cache holds {:?} but q is {dtype:?}",
                cache.dtype()
            )));
        }
        if request.rotary.is_some() && new_tokens.is_none() {
            return Err(AttentionError::unsupported(
                "rotary embedding requires k_new and v_new",
            ));
        }
        let params = &request.params;
        if params.valid_q_lengths.is_some() || params.valid_k_lengths.is_some() {
            return Err(AttentionError::unsupported(
                "valid lengths are expressed through cache_seqlens on the cache path",
            ));
        }
        params.validate(batch, heads_q)?;

        let seqlens = request.cache_seqlens.resolve(batch)?;
        let seqlen_new = new_tokens.map_or(0, |(_, _, len)| len);
        if let Some((table, _)) = &request.rotary {
            let furthest = seqlens.iter().max().copied().unwrap_or(0) + seqlen_new.max(seqlen_q);
            table.validate_for(head_dim, furthest)?;
        }
        let plan = CachePlan::new(
            &layout,
            seqlens.clone(),
            seqlen_new,
            request.cache_batch_idx.clone(),
            request.cache_leftpad.clone(),
            request.block_table.clone(),
        )?;

        // Validation is complete; from here on the cache is written.
        let rotary = request.rotary.as_ref().map(|(table, mode)| (table.as_ref(), *mode));
        if let Some((k_new, v_new, _)) = new_tokens {
            let k_data = k_new.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            let v_data = v_new.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            plan.append(cache, &k_data, &v_data, rotary)?;
        }

        let mut q_data = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        if let Some((table, mode)) = rotary {
            let positional = params.is_positional();
            for (row, x) in q_data.chunks_exact_mut(head_dim).enumerate() {
                let token = row / heads_q;
                let (b, t) = (token / seqlen_q, token % seqlen_q);
                let position = if positional { seqlens[b] + t } else { seqlens[b] };
                table.rotate(x, position, mode);
            }
        }

        let padded = self.padded_head_dim(head_dim);
        let q_data = pad_rows(&q_data, head_dim, padded);
        let mut k_data = Vec::new();
        let mut v_data = Vec::new();
        let mut spans = Vec::with_capacity(batch);
        for b in 0..batch {
            let (keys, values) = plan.gather(cache, b, padded);
            spans.push(SequenceSpan {
                q_start: b * seqlen_q,
                q_len: seqlen_q,
                k_start: k_data.len() / (layout.heads * padded),
                k_len: plan.total_len(b),
            });
            k_data.extend(keys);
            v_data.extend(values);
        }

        let scale = params.resolved_scale(head_dim);
        let params = AttentionParams {
            scale: Some(scale),
            ..params.clone()
        };
        let longest = spans.iter().map(|span| span.k_len).max().unwrap_or(0);
        let num_splits = choose_num_splits(
            request.num_splits,
            batch * heads_q,
            seqlen_q,
            longest,
            head_dim,
            self.capabilities().compute_units,
            self.config().max_splits,
            self.config().tile_k,
        );
        let problem = Problem {
            q: HeadView::new(&q_data, heads_q, padded),
            k: HeadView::new(&k_data, layout.heads, padded),
            v: HeadView::new(&v_data, layout.heads, padded),
            scale,
            params: &params,
            tile_q: self.config().tile_q,
            tile_k: self.config().tile_k,
        };
        log::debug!(
            "dispatch forward_with_cache: batch={batch} seqlen_q={seqlen_q} seqlen_new={seqlen_new} longest={longest} num_splits={num_splits} paged={}",
            plan.is_paged()
        );
        let buffers = split::run(self, &problem, &spans, batch * seqlen_q, num_splits);

        let out = unpack(&buffers.out, padded, q.dims(), self.output_dtype(dtype), self.device())?;
        let lse = if request.return_lse {
            let layout = SeqLayout::padded(batch, seqlen_q, longest);
            Some(stats_tensor(buffers.lse, &layout, heads_q, self.device())?)
        } else {
            None
        };
        Ok(CacheOutput {
            out,
            lse,
            num_splits,
        })
    }
}
