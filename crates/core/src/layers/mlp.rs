use candle_core::{Tensor, D};
use candle_nn::VarBuilder;

use super::activation::Activation;
use super::linear::ShardedLinear;
use crate::distributed::DeviceContext;
use crate::error::Result;
use crate::quantization::QuantizeMode;

/// Gated feed-forward: `down_proj(act(gate_proj(x)) * up_proj(x))`.
///
/// Used for dense MLP layers, routed experts and shared experts. Gate and up
/// are one merged column-sharded operator; `down_proj` is row-sharded and
/// all-reduces only when built with `reduce = true`.
#[derive(Debug)]
pub struct ExpertFfn {
    gate_up_proj: ShardedLinear,
    down_proj: ShardedLinear,
    act: Activation,
    /// Per-shard intermediate width
    intermediate_size: usize,
}

impl ExpertFfn {
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        hidden_size: usize,
        intermediate_size: usize,
        hidden_act: &str,
        reduce: bool,
        quantize: Option<QuantizeMode>,
        vb: VarBuilder,
        ctx: &DeviceContext,
    ) -> Result<Self> {
        let act = Activation::from_name(hidden_act)?;
        let gate_up_proj = ShardedLinear::column_multi(
            hidden_size,
            &[("gate_proj", intermediate_size), ("up_proj", intermediate_size)],
            quantize,
            vb.clone(),
            ctx,
        )?;
        let down_proj = ShardedLinear::row(
            intermediate_size,
            hidden_size,
            false,
            reduce,
            quantize,
            vb.pp("down_proj"),
            ctx,
        )?;
        Ok(Self {
            gate_up_proj,
            down_proj,
            act,
            intermediate_size: ctx.shard_size("intermediate_size", intermediate_size)?,
        })
    }

    pub fn forward(&self, x: &Tensor, ctx: &DeviceContext) -> Result<Tensor> {
        let gate_up = self.gate_up_proj.apply(x, ctx)?;
        let gate = gate_up.narrow(D::Minus1, 0, self.intermediate_size)?;
        let up = gate_up.narrow(D::Minus1, self.intermediate_size, self.intermediate_size)?;
        let hidden = (self.act.forward(&gate)? * up)?;
        self.down_proj.apply(&hidden, ctx)
    }

    pub fn gate_up_proj(&self) -> &ShardedLinear {
        &self.gate_up_proj
    }

    pub fn down_proj(&self) -> &ShardedLinear {
        &self.down_proj
    }

    pub fn activation(&self) -> Activation {
        self.act
    }

    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }
}
