//! Vocabulary projection heads.

use candle_core::{Module, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use crate::error::Result;

/// Maps final hidden states to vocabulary logits.
///
/// Returns `(logits [n, vocab], speculative_logits)`; the second element is
/// `Some([n, heads, vocab])` only for heads carrying speculator heads.
pub trait CausalLMHead: Send + Sync + std::fmt::Debug {
    fn forward(&self, hidden_states: &Tensor) -> Result<(Tensor, Option<Tensor>)>;
}

// ─── Speculator heads ───────────────────────────────────────────────────────

/// One residual speculator head: `proj(x + silu(block(x)))`.
#[derive(Debug)]
struct SpeculatorHead {
    block: Linear,
    proj: Linear,
}

impl SpeculatorHead {
    fn load(hidden_size: usize, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            block: linear_no_bias(hidden_size, hidden_size, vb.pp("block"))?,
            proj: linear_no_bias(hidden_size, vocab_size, vb.pp("proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = (x + candle_nn::ops::silu(&self.block.forward(x)?)?)?;
        Ok(self.proj.forward(&h)?)
    }
}

// ─── Linear head ────────────────────────────────────────────────────────────

/// Replicated `lm_head` with optional speculator heads.
#[derive(Debug)]
pub struct LinearLmHead {
    lm_head: Linear,
    speculator: Vec<SpeculatorHead>,
}

impl LinearLmHead {
    pub fn load(hidden_size: usize, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lm_head: linear_no_bias(hidden_size, vocab_size, vb)?,
            speculator: Vec::new(),
        })
    }

    /// Attach `num_heads` speculator heads stored under `vb` (`{i}.block`,
    /// `{i}.proj`).
    pub fn with_speculator(
        mut self,
        num_heads: usize,
        hidden_size: usize,
        vocab_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        self.speculator = (0..num_heads)
            .map(|i| SpeculatorHead::load(hidden_size, vocab_size, vb.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(num_heads, "speculator heads attached");
        Ok(self)
    }

    pub fn num_speculator_heads(&self) -> usize {
        self.speculator.len()
    }
}

impl CausalLMHead for LinearLmHead {
    fn forward(&self, hidden_states: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        let logits = self.lm_head.forward(hidden_states)?;
        if self.speculator.is_empty() {
            return Ok((logits, None));
        }
        let speculative = self
            .speculator
            .iter()
            .map(|head| head.forward(hidden_states))
            .collect::<Result<Vec<_>>>()?;
        Ok((logits, Some(Tensor::stack(&speculative, 1)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn plain_head_has_no_speculative_logits() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let head = LinearLmHead::load(8, 20, vb).unwrap();
        let x = Tensor::ones((3, 8), DType::F32, &Device::Cpu).unwrap();
        let (logits, spec) = head.forward(&x).unwrap();
        assert_eq!(logits.dims(), &[3, 20]);
        assert!(spec.is_none());
    }

    #[test]
    fn speculator_logits_are_stacked_per_head() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let head = LinearLmHead::load(8, 20, vb.pp("lm_head"))
            .unwrap()
            .with_speculator(3, 8, 20, vb.pp("speculator"))
            .unwrap();
        assert_eq!(head.num_speculator_heads(), 3);
        let x = Tensor::ones((2, 8), DType::F32, &Device::Cpu).unwrap();
        let (logits, spec) = head.forward(&x).unwrap();
        assert_eq!(logits.dims(), &[2, 20]);
        assert_eq!(spec.unwrap().dims(), &[2, 3, 20]);
    }
}
