//! Expert routing.
//!
//! The gate is a replicated, unquantized `hidden -> n_experts` linear. Two
//! weightings are derived from its logits:
//!
//! - [`topk_softmax`]: softmax, keep the k best experts per token, optionally
//!   renormalize the kept weights to sum to 1 (fused dispatch)
//! - [`dense_gate_weights`]: softmax over all experts with the `n - k` lowest
//!   entries zeroed in place, optionally divided by their Lp norm (dense loop)

use candle_core::{DType, Tensor, D};
use candle_nn::VarBuilder;

use crate::distributed::DeviceContext;
use crate::error::{ModelError, Result};
use crate::layers::linear::ShardedLinear;

/// Router gate producing per-token expert logits.
#[derive(Debug)]
pub struct RouterGate {
    gate: ShardedLinear,
    num_experts: usize,
}

impl RouterGate {
    pub fn load(
        hidden_size: usize,
        num_experts: usize,
        vb: VarBuilder,
        ctx: &DeviceContext,
    ) -> Result<Self> {
        // Never quantized: the gate stays in full precision for every mode.
        let gate = ShardedLinear::replicated(hidden_size, num_experts, false, None, vb, ctx)?;
        Ok(Self { gate, num_experts })
    }

    pub fn from_linear(gate: ShardedLinear) -> Result<Self> {
        let num_experts = gate
            .dense_weight()
            .ok_or_else(|| ModelError::config("router gate must not be quantized"))?
            .dim(0)?;
        Ok(Self { gate, num_experts })
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    /// `[num_tokens, hidden] -> [num_tokens, n_experts]`
    pub fn logits(&self, x: &Tensor, ctx: &DeviceContext) -> Result<Tensor> {
        self.gate.apply(x, ctx)
    }
}

fn check_top_k(top_k: usize, num_experts: usize) -> Result<()> {
    if top_k == 0 || top_k > num_experts {
        return Err(ModelError::config(format!(
            "top_k ({top_k}) must be in 1..={num_experts}"
        )));
    }
    Ok(())
}

/// Top-k selection over softmaxed router logits.
///
/// Returns `(weights [n, k] f32, expert_ids [n, k] u32)`, best expert first.
pub fn topk_softmax(logits: &Tensor, top_k: usize, renormalize: bool) -> Result<(Tensor, Tensor)> {
    let (_, num_experts) = logits.dims2()?;
    check_top_k(top_k, num_experts)?;

    let probs = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
    let sorted = probs.arg_sort_last_dim(false)?;
    let expert_ids = sorted.narrow(D::Minus1, 0, top_k)?.contiguous()?;
    let weights = probs.gather(&expert_ids, D::Minus1)?;
    let weights = if renormalize {
        weights.broadcast_div(&weights.sum_keepdim(D::Minus1)?)?
    } else {
        weights
    };
    Ok((weights, expert_ids))
}

/// Dense gating weights `[n, n_experts]` in f32.
///
/// With `top_k < n_experts` the `n - k` lowest probabilities of each token
/// are zeroed; the surviving weights are not renormalized by the mask. With
/// `norm_p = Some(p)` every row is then divided by its Lp norm. All-zero rows
/// are not guarded.
pub fn dense_gate_weights(logits: &Tensor, top_k: usize, norm_p: Option<f64>) -> Result<Tensor> {
    let (num_tokens, num_experts) = logits.dims2()?;
    check_top_k(top_k, num_experts)?;

    let mut weights = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
    if top_k < num_experts {
        let dropped = num_experts - top_k;
        let lowest = weights
            .arg_sort_last_dim(true)?
            .narrow(D::Minus1, 0, dropped)?
            .contiguous()?;
        let ones = Tensor::ones((num_tokens, num_experts), DType::F32, logits.device())?;
        let minus = Tensor::full(-1f32, (num_tokens, dropped), logits.device())?;
        let mask = ones.scatter_add(&lowest, &minus, D::Minus1)?;
        weights = (weights * mask)?;
    }
    if let Some(p) = norm_p {
        let norm = if p == 1.0 {
            weights.abs()?.sum_keepdim(D::Minus1)?
        } else {
            weights
                .abs()?
                .powf(p)?
                .sum_keepdim(D::Minus1)?
                .powf(1.0 / p)?
        };
        weights = weights.broadcast_div(&norm)?;
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits() -> Tensor {
        Tensor::new(
            &[[2.0f32, 0.5, -1.0, 1.0], [0.5, 0.0, 3.0, -2.0]],
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn topk_softmax_picks_best_experts() {
        let (weights, ids) = topk_softmax(&logits(), 2, false).unwrap();
        assert_eq!(ids.to_vec2::<u32>().unwrap(), vec![vec![0, 3], vec![2, 0]]);
        let w = weights.to_vec2::<f32>().unwrap();
        assert!(w[0][0] > w[0][1]);
    }

    #[test]
    fn topk_softmax_renormalizes() {
        let (weights, _) = topk_softmax(&logits(), 2, true).unwrap();
        for row in weights.to_vec2::<f32>().unwrap() {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn dense_weights_zero_lowest_entries() {
        let w = dense_gate_weights(&logits(), 2, None)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(w[0][1], 0.0);
        assert_eq!(w[0][2], 0.0);
        assert!(w[0][0] > 0.0 && w[0][3] > 0.0);
        assert_eq!(w[1][1], 0.0);
        assert_eq!(w[1][3], 0.0);
    }

    #[test]
    fn dense_weights_keep_everything_when_top_k_is_n() {
        let w = dense_gate_weights(&logits(), 4, None)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        for row in w {
            assert!(row.iter().all(|v| *v > 0.0));
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn dense_weights_l2_normalized() {
        let w = dense_gate_weights(&logits(), 3, Some(2.0))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        for row in w {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn invalid_top_k_is_rejected() {
        assert!(matches!(
            topk_softmax(&logits(), 5, true),
            Err(ModelError::Configuration(_))
        ));
        assert!(dense_gate_weights(&logits(), 0, None).is_err());
    }

    #[test]
    fn gate_reports_expert_count() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let gate = RouterGate::load(8, 6, vb, &DeviceContext::single_device()).unwrap();
        assert_eq!(gate.num_experts(), 6);
        let x = Tensor::ones((3, 8), DType::F32, &Device::Cpu).unwrap();
        let logits = gate
            .logits(&x, &DeviceContext::single_device())
            .unwrap();
        assert_eq!(logits.dims(), &[3, 6]);
    }
}
