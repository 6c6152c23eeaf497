//! DeepSeek-V2 decoder: MLA attention over a paged latent cache, with
//! dense or mixture-of-experts feed-forward per layer.
//!
//! Every component is built once from a `VarBuilder` for one shard of the
//! tensor-parallel group. Collectives happen at the attention output
//! projection and once per feed-forward block.

use candle_core::{DType, Module, Tensor};
use candle_nn::{Embedding, VarBuilder};

use super::head::{CausalLMHead, LinearLmHead};
use crate::config::DeepseekV2Config;
use crate::distributed::DeviceContext;
use crate::error::{ModelError, Result};
use crate::kv_cache::LayerKvCache;
use crate::layers::attention::{BatchMetadata, MlaAttention};
use crate::layers::mlp::ExpertFfn;
use crate::layers::normalization::{rms_norm, RmsNorm};
use crate::layers::rotary::RotaryEmbedding;
use crate::moe::MoEDispatcher;

// ─── Sparse MoE block ───────────────────────────────────────────────────────

/// Routed experts plus always-on shared experts.
///
/// `all_reduce(routed * routed_scaling_factor + shared(x))`: both paths
/// return per-shard partial sums so the block needs a single collective.
#[derive(Debug)]
pub struct SparseMoeBlock {
    dispatcher: MoEDispatcher,
    shared_experts: Option<ExpertFfn>,
    routed_scaling_factor: f64,
}

impl SparseMoeBlock {
    pub fn load(cfg: &DeepseekV2Config, vb: VarBuilder, ctx: &DeviceContext) -> Result<Self> {
        let dispatcher = MoEDispatcher::load(cfg, vb.clone(), ctx)?;
        let shared_experts = match cfg.n_shared_experts {
            Some(n) if n > 0 => Some(ExpertFfn::load(
                cfg.hidden_size,
                cfg.moe_intermediate_size * n,
                &cfg.hidden_act,
                false,
                cfg.quantize,
                vb.pp("shared_experts"),
                ctx,
            )?),
            _ => None,
        };
        Ok(Self {
            dispatcher,
            shared_experts,
            routed_scaling_factor: cfg.routed_scaling_factor,
        })
    }

    pub fn dispatcher(&self) -> &MoEDispatcher {
        &self.dispatcher
    }

    pub fn has_shared_experts(&self) -> bool {
        self.shared_experts.is_some()
    }

    pub fn forward(&self, x: &Tensor, ctx: &DeviceContext) -> Result<Tensor> {
        let mut out = (self.dispatcher.mixture(x, ctx)? * self.routed_scaling_factor)?;
        if let Some(shared) = &self.shared_experts {
            out = (out + shared.forward(x, ctx)?)?;
        }
        Ok(ctx.all_reduce_sum(&out)?)
    }
}

// ─── Feed-forward ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum FeedForward {
    Dense(ExpertFfn),
    Sparse(SparseMoeBlock),
}

impl FeedForward {
    pub fn load(
        cfg: &DeepseekV2Config,
        layer_idx: usize,
        vb: VarBuilder,
        ctx: &DeviceContext,
    ) -> Result<Self> {
        if cfg.is_moe_layer(layer_idx) {
            Ok(Self::Sparse(SparseMoeBlock::load(cfg, vb, ctx)?))
        } else {
            Ok(Self::Dense(ExpertFfn::load(
                cfg.hidden_size,
                cfg.intermediate_size,
                &cfg.hidden_act,
                true,
                cfg.quantize,
                vb,
                ctx,
            )?))
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse(_))
    }

    pub fn forward(&self, x: &Tensor, ctx: &DeviceContext) -> Result<Tensor> {
        match self {
            Self::Dense(mlp) => mlp.forward(x, ctx),
            Self::Sparse(moe) => moe.forward(x, ctx),
        }
    }
}

// ─── Decoder layer ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DecoderLayer {
    self_attn: MlaAttention,
    mlp: FeedForward,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    pub fn load(
        cfg: &DeepseekV2Config,
        layer_idx: usize,
        vb: VarBuilder,
        ctx: &DeviceContext,
    ) -> Result<Self> {
        let self_attn = MlaAttention::load(cfg, vb.pp("self_attn"), ctx)?;
        let mlp = FeedForward::load(cfg, layer_idx, vb.pp("mlp"), ctx)?;
        let input_layernorm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        tracing::debug!(
            layer_idx,
            feed_forward = if mlp.is_sparse() { "moe" } else { "dense" },
            "decoder layer"
        );
        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    pub fn self_attn(&self) -> &MlaAttention {
        &self.self_attn
    }

    pub fn mlp(&self) -> &FeedForward {
        &self.mlp
    }

    /// Returns `(hidden_states, residual)` for the next layer.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        residual: Option<&Tensor>,
        cos: &Tensor,
        sin: &Tensor,
        rotary: &RotaryEmbedding,
        cache: &mut LayerKvCache,
        batch: &BatchMetadata,
        ctx: &DeviceContext,
    ) -> Result<(Tensor, Tensor)> {
        let (normed, residual) = self.input_layernorm.forward_residual(hidden_states, residual)?;
        let attn_out = self
            .self_attn
            .forward(&normed, cos, sin, rotary, cache, batch, ctx)?;
        let (normed, residual) = self
            .post_attention_layernorm
            .forward_residual(&attn_out, Some(&residual))?;
        let out = self.mlp.forward(&normed, ctx)?;
        Ok((out, residual))
    }
}

// ─── Model ──────────────────────────────────────────────────────────────────

/// Embedding, decoder stack and final norm.
/// Layers share one cos/sin table, so each attention must rotate exactly
/// `rotary.dim()` channels of its query and key.
fn check_rotary_dim(layer_idx: usize, attn: &MlaAttention, rotary: &RotaryEmbedding) -> Result<()> {
    if attn.rotary_dim() != rotary.dim() {
        return Err(ModelError::config(format!(
            "layer {layer_idx} rotary dimension {} differs from the shared encoder's {}",
            attn.rotary_dim(),
            rotary.dim()
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct DeepseekV2Model {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    rotary: RotaryEmbedding,
    ctx: DeviceContext,
}

impl DeepseekV2Model {
    /// Build from a `VarBuilder` rooted at `model`.
    pub fn load(cfg: &DeepseekV2Config, vb: VarBuilder, ctx: &DeviceContext) -> Result<Self> {
        cfg.validate()?;
        let embed_tokens =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;
        let rotary = RotaryEmbedding::new(
            cfg.qk_rope_head_dim,
            cfg.max_position_embeddings,
            cfg.rope_theta,
            cfg.rope_scaling.as_ref(),
            false,
            vb.device(),
        )?;

        let vb_layers = vb.pp("layers");
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for layer_idx in 0..cfg.num_hidden_layers {
            let layer = DecoderLayer::load(cfg, layer_idx, vb_layers.pp(layer_idx), ctx)?;
            check_rotary_dim(layer_idx, layer.self_attn(), &rotary)?;
            layers.push(layer);
        }
        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;

        tracing::info!(
            num_layers = layers.len(),
            moe_layers = layers.iter().filter(|l| l.mlp().is_sparse()).count(),
            rank = ctx.rank(),
            world_size = ctx.world_size(),
            "deepseek-v2 model loaded"
        );
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary,
            ctx: ctx.clone(),
        })
    }

    pub fn layers(&self) -> &[DecoderLayer] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn rotary(&self) -> &RotaryEmbedding {
        &self.rotary
    }

    /// `input_ids [n] -> hidden_states [n, hidden]`, writing this step's
    /// latents into `caches[i]` for layer `i`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        position_ids: &Tensor,
        caches: &mut [LayerKvCache],
        batch: &BatchMetadata,
    ) -> Result<Tensor> {
        if caches.len() != self.layers.len() {
            return Err(ModelError::shape(
                "kv caches",
                &[self.layers.len()],
                &[caches.len()],
            ));
        }
        let num_tokens = input_ids.dim(0)?;
        let positions = position_ids.dim(0)?;
        if positions != num_tokens {
            return Err(ModelError::shape("position_ids", &[num_tokens], &[positions]));
        }

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        let (cos, sin) = self
            .rotary
            .get_cos_sin(position_ids, batch.max_s, hidden.dtype())?;

        let mut residual: Option<Tensor> = None;
        for (layer, cache) in self.layers.iter().zip(caches.iter_mut()) {
            let (out, res) = layer.forward(
                &hidden,
                residual.as_ref(),
                &cos,
                &sin,
                &self.rotary,
                cache,
                batch,
                &self.ctx,
            )?;
            hidden = out;
            residual = Some(res);
        }
        let (hidden, _) = self.norm.forward_residual(&hidden, residual.as_ref())?;
        Ok(hidden)
    }
}

// ─── Causal LM ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DeepseekV2ForCausalLM {
    model: DeepseekV2Model,
    lm_head: Box<dyn CausalLMHead>,
}

impl DeepseekV2ForCausalLM {
    /// Build from a `VarBuilder` rooted at the checkpoint top level.
    pub fn load(cfg: &DeepseekV2Config, vb: VarBuilder, ctx: &DeviceContext) -> Result<Self> {
        if cfg.tie_word_embeddings {
            return Err(ModelError::config(
                "tie_word_embeddings is not supported for DeepSeek-V2",
            ));
        }
        let model = DeepseekV2Model::load(cfg, vb.pp("model"), ctx)?;
        let lm_head = LinearLmHead::load(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?;
        Ok(Self {
            model,
            lm_head: Box::new(lm_head),
        })
    }

    /// Replace the default linear head.
    pub fn with_lm_head(mut self, lm_head: Box<dyn CausalLMHead>) -> Self {
        self.lm_head = lm_head;
        self
    }

    pub fn model(&self) -> &DeepseekV2Model {
        &self.model
    }

    /// Logits for the rows selected by `lm_head_indices` (every row when
    /// `None`), plus speculative logits when the head produces them.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        position_ids: &Tensor,
        caches: &mut [LayerKvCache],
        batch: &BatchMetadata,
        lm_head_indices: Option<&[usize]>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let hidden = self.model.forward(input_ids, position_ids, caches, batch)?;
        let hidden = match lm_head_indices {
            Some(indices) => {
                let num_tokens = hidden.dim(0)?;
                if let Some(&bad) = indices.iter().find(|&&i| i >= num_tokens) {
                    return Err(ModelError::shape("lm_head_indices", &[num_tokens], &[bad]));
                }
                let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
                let ids = Tensor::new(ids.as_slice(), hidden.device())?;
                hidden.index_select(&ids, 0)?
            }
            None => hidden,
        };
        self.lm_head.forward(&hidden)
    }

    /// Precision the model computes in.
    pub fn dtype(&self) -> DType {
        self.model.embed_tokens.embeddings().dtype()
    }
}
