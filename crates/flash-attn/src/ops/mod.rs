//! Public attention operations exposed as [`FlashEngine`] methods.
//!
//! Every entry point validates shapes, dtypes and parameters up front, packs
//! the tensors into padded `f32` host buffers, runs the tiled kernels on the
//! engine's pool and converts the results back to the caller's layout.

mod cache;
mod pack;

use candle_core::Tensor;

use crate::backward::{self, BackwardProblem};
use crate::context::SavedContext;
use crate::core::{AttentionError, AttentionKernel, AttentionOutput, AttentionParams, FlashEngine, Result};
use crate::forward::{self, HeadView, Problem};
use crate::indexer::{index_vec, SeqLayout};

pub use cache::{CacheOutput, CacheRequest};
use pack::{pack, pad_rows, stats_tensor, stats_token_major, unpack};

/// Result of a padded or ragged forward call.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Same shape as the queries.
    pub out: Tensor,
    /// `[batch, heads_q, seqlen_q]` (padded) or `[heads_q, total_q]`
    /// (ragged), always `f32`.
    pub lse: Tensor,
    /// State for the matching backward call.
    pub context: SavedContext,
}

/// Gradients of one backward call.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
    /// `rowsum(dOut * Out)`, shaped like the log-sum-exp.
    pub softmax_d: Tensor,
}

/// Head counts of a query tensor and a key/value tensor pair.
fn head_counts(q_heads: usize, kv_heads: usize) -> Result<(usize, usize)> {
    if kv_heads == 0 || q_heads % kv_heads != 0 {
        return Err(AttentionError::shape(format!(
            "query heads ({q_heads}) must be a positive multiple of key/value heads ({kv_heads})"
        )));
    }
    Ok((q_heads, kv_heads))
}

fn same_dims(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() != expected {
        return Err(AttentionError::shape(format!(
            "{name} has shape {:?}, expected {expected:?}",
            tensor.dims()
        )));
    }
    Ok(())
}

/// Layout of a padded `[batch, seq, heads, dim]` call.
fn padded_layout(q: &Tensor, k: &Tensor, v: &Tensor, params: &AttentionParams) -> Result<SeqLayout> {
    let (batch, seqlen_q, heads_q, dim) = q.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "q must have shape [batch, seqlen_q, heads, head_dim], got {:?}",
            q.dims()
        ))
    })?;
    let (batch_k, seqlen_k, heads_kv, dim_k) = k.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "k must have shape [batch, seqlen_k, heads_kv, head_dim], got {:?}",
            k.dims()
        ))
    })?;
    same_dims("v", v, k.dims())?;
    if batch_k != batch || dim_k != dim {
        return Err(AttentionError::shape(format!(
            "k {:?} is incompatible with q {:?}",
            k.dims(),
            q.dims()
        )));
    }
    head_counts(heads_q, heads_kv)?;
    params.validate(batch, heads_q)?;
    SeqLayout::padded_with_lengths(
        batch,
        seqlen_q,
        seqlen_k,
        params.valid_q_lengths.clone(),
        params.valid_k_lengths.clone(),
    )
}

/// Layout of a ragged `[tokens, heads, dim]` call.
fn ragged_layout(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    cu_seqlens: (&Tensor, &Tensor),
    max_seqlen: (usize, usize),
    params: &AttentionParams,
) -> Result<SeqLayout> {
    let (total_q, heads_q, dim) = q.dims3().map_err(|_| {
        AttentionError::shape(format!(
            "q must have shape [total_q, heads, head_dim], got {:?}",
            q.dims()
        ))
    })?;
    let (total_k, heads_kv, dim_k) = k.dims3().map_err(|_| {
        AttentionError::shape(format!(
            "k must have shape [total_k, heads_kv, head_dim], got {:?}",
            k.dims()
        ))
    })?;
    same_dims("v", v, k.dims())?;
    if dim_k != dim {
        return Err(AttentionError::shape(format!(
            "k head dim {dim_k} does not match q head dim {dim}"
        )));
    }
    head_counts(heads_q, heads_kv)?;
    if params.valid_q_lengths.is_some() || params.valid_k_lengths.is_some() {
        return Err(AttentionError::unsupported(
            "valid lengths apply to padded inputs; ragged calls encode lengths in cu_seqlens",
        ));
    }
    let layout = SeqLayout::ragged(
        index_vec(cu_seqlens.0, "cu_seqlens_q")?,
        index_vec(cu_seqlens.1, "cu_seqlens_k")?,
        max_seqlen.0,
        max_seqlen.1,
    )?;
    if layout.total_q() != total_q || layout.total_k() != total_k {
        return Err(AttentionError::shape(format!(
            "cu_seqlens cover {} query and {} key tokens, tensors hold {total_q} and {total_k}",
            layout.total_q(),
            layout.total_k()
        )));
    }
    params.validate(layout.batch(), heads_q)?;
    Ok(layout)
}

/// Heads are always the second-to-last dimension.
fn heads_of(dims: &[usize]) -> usize {
    dims.len().checked_sub(2).map(|i| dims[i]).unwrap_or(0)
}

impl FlashEngine {
    /// Padded attention over `[batch, seq, heads, head_dim]` tensors.
    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, params: &AttentionParams) -> Result<ForwardOutput> {
        let layout = padded_layout(q, k, v, params)?;
        self.run_forward(q, k, v, params, layout)
    }

    /// Attention over packed `[tokens, heads, head_dim]` sequences delimited
    /// by cumulative offsets.
    #[allow(clippy::too_many_arguments)]
    pub fn varlen_forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cu_seqlens_q: &Tensor,
        cu_seqlens_k: &Tensor,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
        params: &AttentionParams,
    ) -> Result<ForwardOutput> {
        let layout = ragged_layout(
            q,
            k,
            v,
            (cu_seqlens_q, cu_seqlens_k),
            (max_seqlen_q, max_seqlen_k),
            params,
        )?;
        self.run_forward(q, k, v, params, layout)
    }

    /// Gradients of a padded forward call.
    pub fn backward(&self, d_out: &Tensor, context: &SavedContext) -> Result<Gradients> {
        if context.layout.is_ragged() {
            return Err(AttentionError::unsupported(
                "context comes from varlen_forward; use varlen_backward",
            ));
        }
        self.run_backward(d_out, context)
    }

    /// Gradients of a ragged forward call.
    pub fn varlen_backward(&self, d_out: &Tensor, context: &SavedContext) -> Result<Gradients> {
        if !context.layout.is_ragged() {
            return Err(AttentionError::unsupported(
                "context comes from a padded forward; use backward",
            ));
        }
        self.run_backward(d_out, context)
    }

    /// Backward from individually held forward tensors.
    #[allow(clippy::too_many_arguments)]
    pub fn backward_from_parts(
        &self,
        d_out: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        out: &Tensor,
        lse: &Tensor,
        params: &AttentionParams,
        deterministic: bool,
    ) -> Result<Gradients> {
        let layout = padded_layout(q, k, v, params)?;
        let head_dim = q.dims().last().copied().unwrap_or(0);
        let mut params = params.clone();
        params.scale = Some(params.resolved_scale(head_dim));
        let context = SavedContext::capture([q, k, v, out, lse], params, layout)?
            .with_deterministic(deterministic);
        self.backward(d_out, &context)
    }

    fn run_forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        params: &AttentionParams,
        layout: SeqLayout,
    ) -> Result<ForwardOutput> {
        let dtype = self.check_inputs(&[("q", q), ("k", k), ("v", v)])?;
        let head_dim = q.dims().last().copied().unwrap_or(0);
        let padded = self.padded_head_dim(head_dim);
        let (heads_q, heads_kv) = (heads_of(q.dims()), heads_of(k.dims()));

        let scale = params.resolved_scale(head_dim);
        let params = AttentionParams {
            scale: Some(scale),
            ..params.clone()
        };
        let (q_data, k_data, v_data) = (pack(q, padded)?, pack(k, padded)?, pack(v, padded)?);
        let problem = Problem {
            q: HeadView::new(&q_data, heads_q, padded),
            k: HeadView::new(&k_data, heads_kv, padded),
            v: HeadView::new(&v_data, heads_kv, padded),
            scale,
            params: &params,
            tile_q: self.config().tile_q,
            tile_k: self.config().tile_k,
        };
        log::debug!(
            "dispatch forward: ragged={} batch={} heads={}/{} head_dim={} padded={}",
            layout.is_ragged(),
            layout.batch(),
            heads_q,
            heads_kv,
            head_dim,
            padded
        );
        let buffers = forward::run(self, &problem, &layout.spans(), layout.total_q());

        let out = unpack(&buffers.out, padded, q.dims(), self.output_dtype(dtype), self.device())?;
        let lse = stats_tensor(buffers.lse, &layout, heads_q, self.device())?;
        let context = SavedContext::capture([q, k, v, &out, &lse], params, layout)?;
        Ok(ForwardOutput { out, lse, context })
    }

    fn check_context(&self, d_out: &Tensor, context: &SavedContext) -> Result<()> {
        let layout = &context.layout;
        layout.validate()?;
        for (name, saved) in [
            ("q", &context.q),
            ("k", &context.k),
            ("v", &context.v),
            ("out", &context.out),
            ("lse", &context.lse),
        ] {
            saved.check_len(name)?;
        }
        let (q, k) = (&context.q.dims, &context.k.dims);
        let rank = if layout.is_ragged() { 3 } else { 4 };
        if q.len() != rank || k.len() != rank || context.v.dims != *k || context.out.dims != *q {
            return Err(AttentionError::shape(format!(
                "saved tensors q {q:?}, k {k:?}, v {:?}, out {:?} do not form a rank-{rank} call",
                context.v.dims, context.out.dims
            )));
        }
        let tokens_match = match layout {
            SeqLayout::Padded {
                batch,
                seqlen_q,
                seqlen_k,
                ..
            } => q[..2] == [*batch, *seqlen_q] && k[..2] == [*batch, *seqlen_k],
            SeqLayout::Ragged { .. } => q[0] == layout.total_q() && k[0] == layout.total_k(),
        };
        if !tokens_match {
            return Err(AttentionError::shape(
                "saved tensors disagree with the saved sequence layout",
            ));
        }
        let (heads_q, _) = head_counts(heads_of(q), heads_of(k))?;
        let lse_dims = match layout {
            SeqLayout::Padded {
                batch, seqlen_q, ..
            } => vec![*batch, heads_q, *seqlen_q],
            SeqLayout::Ragged { .. } => vec![heads_q, layout.total_q()],
        };
        if context.lse.dims != lse_dims || q[rank - 1] != k[rank - 1] {
            return Err(AttentionError::shape(format!(
                "saved lse {:?} does not match q {q:?}",
                context.lse.dims
            )));
        }
        context.params.validate(layout.batch(), heads_q)?;
        same_dims("d_out", d_out, q)?;
        self.check_inputs(&[("d_out", d_out)])?;
        Ok(())
    }

    fn run_backward(&self, d_out: &Tensor, context: &SavedContext) -> Result<Gradients> {
        self.check_context(d_out, context)?;
        let head_dim = context.head_dim();
        let padded = self.padded_head_dim(head_dim);
        let (heads_q, heads_kv) = (heads_of(&context.q.dims), heads_of(&context.k.dims));
        let layout = &context.layout;
        let device = self.device();

        let q = pad_rows(&context.q.data, head_dim, padded);
        let k = pad_rows(&context.k.data, head_dim, padded);
        let v = pad_rows(&context.v.data, head_dim, padded);
        let out = pad_rows(&context.out.data, head_dim, padded);
        let d_out_data = pack(d_out, padded)?;
        let lse = stats_token_major(&context.lse.to_tensor(device)?, layout)?;
        let delta = backward::compute_delta(self, &d_out_data, &out, padded);

        let problem = BackwardProblem {
            fwd: Problem {
                q: HeadView::new(&q, heads_q, padded),
                k: HeadView::new(&k, heads_kv, padded),
                v: HeadView::new(&v, heads_kv, padded),
                scale: context.scale(),
                params: &context.params,
                tile_q: self.config().tile_q,
                tile_k: self.config().tile_k,
            },
            d_out: HeadView::new(&d_out_data, heads_q, padded),
            lse: &lse,
            delta: &delta,
        };
        log::debug!(
            "dispatch backward: ragged={} deterministic={} heads={heads_q}/{heads_kv} head_dim={head_dim}",
            layout.is_ragged(),
            context.deterministic
        );
        let grads = backward::run(
            self,
            &problem,
            &layout.spans(),
            layout.total_q(),
            layout.total_k(),
            context.deterministic,
        );

        let dtype = |saved: &crate::context::SavedTensor| self.output_dtype(saved.dtype.dtype());
        Ok(Gradients {
            dq: unpack(&grads.dq, padded, &context.q.dims, dtype(&context.q), device)?,
            dk: unpack(&grads.dk, padded, &context.k.dims, dtype(&context.k), device)?,
            dv: unpack(&grads.dv, padded, &context.v.dims, dtype(&context.v), device)?,
            softmax_d: stats_tensor(delta, layout, heads_q, device)?,
        })
    }
}

impl AttentionKernel for FlashEngine {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, params: &AttentionParams) -> Result<AttentionOutput> {
        let ForwardOutput { out, lse, .. } = self.forward(q, k, v, params)?;
        Ok(AttentionOutput { out, lse })
    }
}
