//! Multi-head Latent Attention (MLA).
//!
//! MLA compresses K/V through a low-rank latent. Per token the cache holds:
//! - the normalized latent `[kv_lora_rank]`
//! - the rotated rope key `[qk_rope_head_dim]`, shared by all heads
//!
//! Prefill expands the fresh latent through `kv_b_proj` and runs causal
//! attention over the new tokens. Decode gathers each sequence's cached
//! latents, expands them the same way and attends with its single query.

use candle_core::{Module, Tensor, D};
use candle_nn::VarBuilder;

use super::metadata::BatchMetadata;
use super::ops::{single_query_attention, varlen_causal_attention};
use crate::config::DeepseekV2Config;
use crate::distributed::DeviceContext;
use crate::error::{ModelError, Result};
use crate::kv_cache::LayerKvCache;
use crate::layers::linear::ShardedLinear;
use crate::layers::normalization::{rms_norm, RmsNorm};
use crate::layers::rotary::{yarn_mscale, RotaryEmbedding};

/// Query projection: direct, or through a normalized low-rank bottleneck.
#[derive(Debug)]
enum QueryProjection {
    Direct(ShardedLinear),
    LowRank {
        q_a_proj: ShardedLinear,
        q_a_layernorm: RmsNorm,
        q_b_proj: ShardedLinear,
    },
}

impl QueryProjection {
    fn apply(&self, x: &Tensor, ctx: &DeviceContext) -> Result<Tensor> {
        match self {
            Self::Direct(q_proj) => q_proj.apply(x, ctx),
            Self::LowRank {
                q_a_proj,
                q_a_layernorm,
                q_b_proj,
            } => {
                let q_latent = q_a_layernorm.forward(&q_a_proj.apply(x, ctx)?)?;
                q_b_proj.apply(&q_latent, ctx)
            }
        }
    }
}

#[derive(Debug)]
pub struct MlaAttention {
    q: QueryProjection,
    kv_a_proj_with_mqa: ShardedLinear,
    kv_a_layernorm: RmsNorm,
    kv_b_proj: ShardedLinear,
    o_proj: ShardedLinear,
    /// Heads on this shard
    num_heads: usize,
    hidden_size: usize,
    qk_nope_head_dim: usize,
    qk_rope_head_dim: usize,
    v_head_dim: usize,
    kv_lora_rank: usize,
    softmax_scale: f64,
}

impl MlaAttention {
    pub fn load(cfg: &DeepseekV2Config, vb: VarBuilder, ctx: &DeviceContext) -> Result<Self> {
        let num_heads_total = cfg.num_attention_heads;
        if num_heads_total % ctx.world_size() != 0 {
            return Err(ModelError::config(format!(
                "num_attention_heads ({num_heads_total}) must be divisible by world_size ({})",
                ctx.world_size()
            )));
        }
        let num_heads = num_heads_total / ctx.world_size();
        let qk_head_dim = cfg.qk_head_dim();
        let bias = cfg.attention_bias;
        let quantize = cfg.quantize;

        let q = match cfg.q_lora_rank {
            None => QueryProjection::Direct(ShardedLinear::column(
                cfg.hidden_size,
                num_heads_total * qk_head_dim,
                bias,
                quantize,
                vb.pp("q_proj"),
                ctx,
            )?),
            Some(q_lora_rank) => QueryProjection::LowRank {
                q_a_proj: ShardedLinear::replicated(
                    cfg.hidden_size,
                    q_lora_rank,
                    bias,
                    quantize,
                    vb.pp("q_a_proj"),
                    ctx,
                )?,
                q_a_layernorm: rms_norm(q_lora_rank, cfg.rms_norm_eps, vb.pp("q_a_layernorm"))?,
                q_b_proj: ShardedLinear::column(
                    q_lora_rank,
                    num_heads_total * qk_head_dim,
                    false,
                    quantize,
                    vb.pp("q_b_proj"),
                    ctx,
                )?,
            },
        };

        let kv_a_proj_with_mqa = ShardedLinear::replicated(
            cfg.hidden_size,
            cfg.kv_lora_rank + cfg.qk_rope_head_dim,
            bias,
            quantize,
            vb.pp("kv_a_proj_with_mqa"),
            ctx,
        )?;
        let kv_a_layernorm = rms_norm(cfg.kv_lora_rank, cfg.rms_norm_eps, vb.pp("kv_a_layernorm"))?;
        let kv_b_proj = ShardedLinear::column(
            cfg.kv_lora_rank,
            num_heads_total * (cfg.qk_nope_head_dim + cfg.v_head_dim),
            false,
            quantize,
            vb.pp("kv_b_proj"),
            ctx,
        )?;
        let o_proj = ShardedLinear::row(
            num_heads_total * cfg.v_head_dim,
            cfg.hidden_size,
            false,
            true,
            quantize,
            vb.pp("o_proj"),
            ctx,
        )?;

        let mut softmax_scale = (qk_head_dim as f64).powf(-0.5);
        if let Some(scaling) = cfg.rope_scaling.as_ref().filter(|s| s.is_yarn()) {
            let mscale = yarn_mscale(scaling.factor, scaling.mscale_all_dim);
            softmax_scale *= mscale * mscale;
        }

        Ok(Self {
            q,
            kv_a_proj_with_mqa,
            kv_a_layernorm,
            kv_b_proj,
            o_proj,
            num_heads,
            hidden_size: cfg.hidden_size,
            qk_nope_head_dim: cfg.qk_nope_head_dim,
            qk_rope_head_dim: cfg.qk_rope_head_dim,
            v_head_dim: cfg.v_head_dim,
            kv_lora_rank: cfg.kv_lora_rank,
            softmax_scale,
        })
    }

    pub fn rotary_dim(&self) -> usize {
        self.qk_rope_head_dim
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn softmax_scale(&self) -> f64 {
        self.softmax_scale
    }

    /// Expand latents `[len, kv_lora_rank]` into `(k_nope, v)` per head.
    fn expand_latent(&self, latent: &Tensor, ctx: &DeviceContext) -> Result<(Tensor, Tensor)> {
        let len = latent.dim(0)?;
        let kv = self.kv_b_proj.apply(latent, ctx)?.reshape((
            len,
            self.num_heads,
            self.qk_nope_head_dim + self.v_head_dim,
        ))?;
        let k_nope = kv.narrow(D::Minus1, 0, self.qk_nope_head_dim)?;
        let v = kv
            .narrow(D::Minus1, self.qk_nope_head_dim, self.v_head_dim)?
            .contiguous()?;
        Ok((k_nope, v))
    }

    /// `[k_nope | k_pe]` with the shared rope key broadcast to every head.
    fn full_keys(&self, k_nope: &Tensor, k_pe: &Tensor) -> Result<Tensor> {
        let len = k_nope.dim(0)?;
        let k_pe = k_pe
            .reshape((len, 1, self.qk_rope_head_dim))?
            .broadcast_as((len, self.num_heads, self.qk_rope_head_dim))?
            .contiguous()?;
        Ok(Tensor::cat(&[&k_nope.contiguous()?, &k_pe], D::Minus1)?)
    }

    /// `hidden_states [num_tokens, hidden] -> [num_tokens, hidden]`.
    ///
    /// Writes this step's latents into `cache` before any read.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        rotary: &RotaryEmbedding,
        cache: &mut LayerKvCache,
        batch: &BatchMetadata,
        ctx: &DeviceContext,
    ) -> Result<Tensor> {
        let (num_tokens, hidden) = hidden_states.dims2()?;
        if hidden != self.hidden_size {
            return Err(ModelError::shape(
                "attention input",
                &[num_tokens, self.hidden_size],
                &[num_tokens, hidden],
            ));
        }
        batch.validate(num_tokens)?;

        let q = self.q.apply(hidden_states, ctx)?.reshape((
            num_tokens,
            self.num_heads,
            self.qk_nope_head_dim + self.qk_rope_head_dim,
        ))?;
        let q_nope = q.narrow(D::Minus1, 0, self.qk_nope_head_dim)?;
        let q_pe = q
            .narrow(D::Minus1, self.qk_nope_head_dim, self.qk_rope_head_dim)?
            .contiguous()?;

        let kv_a = self.kv_a_proj_with_mqa.apply(hidden_states, ctx)?;
        let latent = kv_a.narrow(D::Minus1, 0, self.kv_lora_rank)?;
        let latent = self.kv_a_layernorm.forward(&latent)?;
        let k_pe = kv_a
            .narrow(D::Minus1, self.kv_lora_rank, self.qk_rope_head_dim)?
            .reshape((num_tokens, 1, self.qk_rope_head_dim))?;

        let (q_pe, k_pe) = rotary.apply(&q_pe, &k_pe, cos, sin)?;
        let k_pe = k_pe.reshape((num_tokens, self.qk_rope_head_dim))?;

        cache.reshape_and_cache(&latent, &k_pe, &batch.slots)?;

        let q = Tensor::cat(&[&q_nope.contiguous()?, &q_pe], D::Minus1)?;

        let attn = match &batch.cu_seqlen_prefill {
            Some(cu_seqlens) => {
                tracing::trace!(num_tokens, sequences = cu_seqlens.len() - 1, "mla prefill");
                let (k_nope, v) = self.expand_latent(&latent, ctx)?;
                let k = self.full_keys(&k_nope, &k_pe)?;
                varlen_causal_attention(&q, &k, &v, cu_seqlens, self.softmax_scale)?
            }
            None => {
                tracing::trace!(num_tokens, "mla decode");
                let mut outputs = Vec::with_capacity(num_tokens);
                for (i, (blocks, &len)) in batch
                    .block_tables
                    .iter()
                    .zip(&batch.input_lengths)
                    .enumerate()
                {
                    let (latent_i, k_pe_i) = cache.gather(blocks, len)?;
                    let (k_nope, v) = self.expand_latent(&latent_i, ctx)?;
                    let k = self.full_keys(&k_nope, &k_pe_i)?;
                    outputs.push(single_query_attention(
                        &q.get(i)?,
                        &k,
                        &v,
                        self.softmax_scale,
                    )?);
                }
                Tensor::stack(&outputs, 0)?
            }
        };

        let attn = attn.reshape((num_tokens, self.num_heads * self.v_head_dim))?;
        self.o_proj.apply(&attn, ctx)
    }
}
