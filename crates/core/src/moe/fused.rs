//! Fused expert dispatch over stacked expert weights.
//!
//! Permute, compute, unpermute: tokens are grouped by the experts that
//! selected them, each expert runs one batched GEMM pair over its group, and
//! the weighted rows are added back into the output with `index_add`.

use candle_core::{IndexOp, Tensor};

use super::router::topk_softmax;
use crate::error::{ModelError, Result};
use crate::layers::activation::Activation;

/// Token rows routed to each expert.
#[derive(Debug)]
struct ExpertGroups {
    /// Per expert: `(token_idx, flat index into the [n, k] routing weights)`
    groups: Vec<Vec<(u32, u32)>>,
}

impl ExpertGroups {
    fn from_ids(expert_ids: &Tensor, num_experts: usize) -> Result<Self> {
        let (_, top_k) = expert_ids.dims2()?;
        let ids: Vec<u32> = expert_ids.flatten_all()?.to_vec1()?;
        let mut groups = vec![Vec::new(); num_experts];
        for (flat, &expert) in ids.iter().enumerate() {
            let expert = expert as usize;
            if expert >= num_experts {
                return Err(ModelError::config(format!(
                    "router selected expert {expert} of {num_experts}"
                )));
            }
            groups[expert].push(((flat / top_k) as u32, flat as u32));
        }
        Ok(Self { groups })
    }
}

/// Routed mixture `sum_k w_k * expert_k(x)` for `x [n, H]`.
///
/// * `w13` - stacked merged gate/up weights `[E, 2 * I, H]`
/// * `w2` - stacked down weights `[E, H, I]`
/// * `router_logits` - `[n, E]`
///
/// Returns this shard's partial result `[n, H]`; the caller reduces.
pub fn fused_moe(
    x: &Tensor,
    w13: &Tensor,
    w2: &Tensor,
    router_logits: &Tensor,
    top_k: usize,
    renormalize: bool,
    act: Activation,
) -> Result<Tensor> {
    let (num_tokens, hidden_size) = x.dims2()?;
    let (num_experts, gate_up, w13_in) = w13.dims3()?;
    let (w2_experts, w2_out, intermediate) = w2.dims3()?;
    if w13_in != hidden_size || w2_out != hidden_size || w2_experts != num_experts {
        return Err(ModelError::shape(
            "fused_moe weights",
            &[num_experts, 2 * intermediate, hidden_size],
            w13.dims(),
        ));
    }
    if gate_up != 2 * intermediate {
        return Err(ModelError::shape(
            "fused_moe w13",
            &[num_experts, 2 * intermediate, hidden_size],
            w13.dims(),
        ));
    }
    let logit_experts = router_logits.dim(1)?;
    if logit_experts != num_experts {
        return Err(ModelError::shape(
            "fused_moe router logits",
            &[num_tokens, num_experts],
            router_logits.dims(),
        ));
    }

    let (weights, expert_ids) = topk_softmax(router_logits, top_k, renormalize)?;
    let flat_weights = weights.flatten_all()?.to_dtype(x.dtype())?;
    let groups = ExpertGroups::from_ids(&expert_ids, num_experts)?;

    let device = x.device();
    let mut output = Tensor::zeros((num_tokens, hidden_size), x.dtype(), device)?;
    for (expert, rows) in groups.groups.iter().enumerate() {
        if rows.is_empty() {
            continue;
        }
        let (tokens, flat): (Vec<u32>, Vec<u32>) = rows.iter().copied().unzip();
        let tokens = Tensor::new(tokens.as_slice(), device)?;
        let flat = Tensor::new(flat.as_slice(), device)?;

        let batch = x.index_select(&tokens, 0)?;
        let gate_up = batch.matmul(&w13.i(expert)?.t()?)?;
        let gate = gate_up.narrow(1, 0, intermediate)?;
        let up = gate_up.narrow(1, intermediate, intermediate)?;
        let hidden = (act.forward(&gate)? * up)?;
        let expert_out = hidden.matmul(&w2.i(expert)?.t()?)?;

        let scale = flat_weights.index_select(&flat, 0)?.unsqueeze(1)?;
        let weighted = expert_out.broadcast_mul(&scale)?;
        output = output.index_add(&tokens, &weighted, 0)?;
    }
    tracing::trace!(num_tokens, num_experts, top_k, "fused moe");
    Ok(output)
}
