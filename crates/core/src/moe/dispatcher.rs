//! Routed-expert dispatch.
//!
//! Two strategies produce the same mixture `sum_e w_e * expert_e(x)`:
//!
//! - **Fused**: top-k selection, experts batched over their routed tokens
//!   using stacked weights (unquantized checkpoints)
//! - **Dense loop**: masked dense gate weights, every expert evaluated on
//!   every token (quantized checkpoints, where weights cannot be stacked)
//!
//! Both return the mixture un-reduced from [`MoEDispatcher::mixture`];
//! [`MoEDispatcher::forward`] adds the all-reduce.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::fused::fused_moe;
use super::router::{dense_gate_weights, RouterGate};
use crate::config::DeepseekV2Config;
use crate::distributed::DeviceContext;
use crate::error::{ModelError, Result};
use crate::layers::activation::Activation;
use crate::layers::linear::ShardedLinear;
use crate::layers::mlp::ExpertFfn;
use crate::quantization::check_expert_quantization;

/// Experts pre-stacked for the fused kernel.
#[derive(Debug)]
pub struct FusedExperts {
    gate: RouterGate,
    /// `[E, 2 * I/ws, H]`
    w13: Tensor,
    /// `[E, H, I/ws]`
    w2: Tensor,
    act: Activation,
    top_k: usize,
    renormalize: bool,
}

/// Experts evaluated one by one against dense gate weights.
#[derive(Debug)]
pub struct DenseLoopExperts {
    gate: RouterGate,
    experts: Vec<ExpertFfn>,
    top_k: usize,
    norm_p: Option<f64>,
}

#[derive(Debug)]
pub enum MoEDispatcher {
    Fused(FusedExperts),
    DenseLoop(DenseLoopExperts),
}

fn check_expert_count(gate: &RouterGate, experts: &[ExpertFfn], top_k: usize) -> Result<()> {
    if experts.is_empty() || gate.num_experts() != experts.len() {
        return Err(ModelError::config(format!(
            "router gate has {} outputs but {} experts were built",
            gate.num_experts(),
            experts.len()
        )));
    }
    if top_k == 0 || top_k > experts.len() {
        return Err(ModelError::config(format!(
            "top_k ({top_k}) must be in 1..={}",
            experts.len()
        )));
    }
    Ok(())
}

impl MoEDispatcher {
    /// Build the gate and routed experts under `vb` (`gate`, `experts.{i}`).
    ///
    /// Unquantized checkpoints get the fused dispatcher; quantized ones fall
    /// back to the dense loop.
    pub fn load(cfg: &DeepseekV2Config, vb: VarBuilder, ctx: &DeviceContext) -> Result<Self> {
        let num_experts = cfg
            .n_routed_experts
            .ok_or_else(|| ModelError::config("MoE block requires n_routed_experts"))?;
        check_expert_quantization(cfg.quantize)?;

        let gate = RouterGate::load(cfg.hidden_size, num_experts, vb.pp("gate"), ctx)?;
        let vb_experts = vb.pp("experts");
        let experts = (0..num_experts)
            .map(|i| {
                ExpertFfn::load(
                    cfg.hidden_size,
                    cfg.moe_intermediate_size,
                    &cfg.hidden_act,
                    false,
                    cfg.quantize,
                    vb_experts.pp(i),
                    ctx,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        match cfg.quantize {
            None => Self::fused(gate, &experts, cfg.top_k(), cfg.norm_topk_prob),
            Some(mode) => {
                tracing::info!(
                    quantize = %mode,
                    num_experts,
                    "quantized experts, using dense-loop MoE dispatch"
                );
                Self::dense_loop(gate, experts, cfg.top_k(), cfg.dense_norm_p())
            }
        }
    }

    /// Stack the experts' weights for fused dispatch. Fails on quantized
    /// experts.
    pub fn fused(
        gate: RouterGate,
        experts: &[ExpertFfn],
        top_k: usize,
        renormalize: bool,
    ) -> Result<Self> {
        check_expert_count(&gate, experts, top_k)?;
        let gate_up: Vec<&ShardedLinear> = experts.iter().map(|e| e.gate_up_proj()).collect();
        let down: Vec<&ShardedLinear> = experts.iter().map(|e| e.down_proj()).collect();
        let w13 = ShardedLinear::stack_weights(&gate_up)?;
        let w2 = ShardedLinear::stack_weights(&down)?;
        Ok(Self::Fused(FusedExperts {
            gate,
            w13,
            w2,
            act: experts[0].activation(),
            top_k,
            renormalize,
        }))
    }

    pub fn dense_loop(
        gate: RouterGate,
        experts: Vec<ExpertFfn>,
        top_k: usize,
        norm_p: Option<f64>,
    ) -> Result<Self> {
        check_expert_count(&gate, &experts, top_k)?;
        Ok(Self::DenseLoop(DenseLoopExperts {
            gate,
            experts,
            top_k,
            norm_p,
        }))
    }

    pub fn num_experts(&self) -> usize {
        match self {
            Self::Fused(f) => f.gate.num_experts(),
            Self::DenseLoop(d) => d.experts.len(),
        }
    }

    pub fn top_k(&self) -> usize {
        match self {
            Self::Fused(f) => f.top_k,
            Self::DenseLoop(d) => d.top_k,
        }
    }

    pub fn is_fused(&self) -> bool {
        matches!(self, Self::Fused(_))
    }

    /// This shard's partial routed mixture `[n, H]`, not reduced.
    pub fn mixture(&self, x: &Tensor, ctx: &DeviceContext) -> Result<Tensor> {
        match self {
            Self::Fused(f) => {
                let logits = f.gate.logits(x, ctx)?;
                fused_moe(x, &f.w13, &f.w2, &logits, f.top_k, f.renormalize, f.act)
            }
            Self::DenseLoop(d) => {
                let logits = d.gate.logits(x, ctx)?;
                let weights = dense_gate_weights(&logits, d.top_k, d.norm_p)?.to_dtype(x.dtype())?;
                let mut out = Tensor::zeros_like(x)?;
                for (i, expert) in d.experts.iter().enumerate() {
                    let y = expert.forward(x, ctx)?;
                    out = (out + y.broadcast_mul(&weights.narrow(1, i, 1)?)?)?;
                }
                tracing::trace!(num_experts = d.experts.len(), "dense-loop moe");
                Ok(out)
            }
        }
    }

    /// Routed mixture summed across shards.
    pub fn forward(&self, x: &Tensor, ctx: &DeviceContext) -> Result<Tensor> {
        let partial = self.mixture(x, ctx)?;
        Ok(ctx.all_reduce_sum(&partial)?)
    }
}
