//! Checkpoint tensor names and full (unsharded) shapes.

use crate::config::DeepseekV2Config;

fn push_linear(
    out: &mut Vec<(String, Vec<usize>)>,
    prefix: &str,
    in_features: usize,
    out_features: usize,
    bias: bool,
) {
    out.push((format!("{prefix}.weight"), vec![out_features, in_features]));
    if bias {
        out.push((format!("{prefix}.bias"), vec![out_features]));
    }
}

fn push_ffn(out: &mut Vec<(String, Vec<usize>)>, prefix: &str, hidden: usize, intermediate: usize) {
    push_linear(out, &format!("{prefix}.gate_proj"), hidden, intermediate, false);
    push_linear(out, &format!("{prefix}.up_proj"), hidden, intermediate, false);
    push_linear(out, &format!("{prefix}.down_proj"), intermediate, hidden, false);
}

/// Every `(name, shape)` the causal LM requests from its `VarBuilder`.
pub fn expected_tensors(cfg: &DeepseekV2Config) -> Vec<(String, Vec<usize>)> {
    let hidden = cfg.hidden_size;
    let heads = cfg.num_attention_heads;
    let bias = cfg.attention_bias;
    let mut out = vec![(
        "model.embed_tokens.weight".to_string(),
        vec![cfg.vocab_size, hidden],
    )];

    for i in 0..cfg.num_hidden_layers {
        let layer = format!("model.layers.{i}");
        out.push((format!("{layer}.input_layernorm.weight"), vec![hidden]));
        out.push((format!("{layer}.post_attention_layernorm.weight"), vec![hidden]));

        let attn = format!("{layer}.self_attn");
        let q_out = heads * cfg.qk_head_dim();
        match cfg.q_lora_rank {
            None => push_linear(&mut out, &format!("{attn}.q_proj"), hidden, q_out, bias),
            Some(rank) => {
                push_linear(&mut out, &format!("{attn}.q_a_proj"), hidden, rank, bias);
                out.push((format!("{attn}.q_a_layernorm.weight"), vec![rank]));
                push_linear(&mut out, &format!("{attn}.q_b_proj"), rank, q_out, false);
            }
        }
        push_linear(
            &mut out,
            &format!("{attn}.kv_a_proj_with_mqa"),
            hidden,
            cfg.kv_lora_rank + cfg.qk_rope_head_dim,
            bias,
        );
        out.push((format!("{attn}.kv_a_layernorm.weight"), vec![cfg.kv_lora_rank]));
        push_linear(
            &mut out,
            &format!("{attn}.kv_b_proj"),
            cfg.kv_lora_rank,
            heads * (cfg.qk_nope_head_dim + cfg.v_head_dim),
            false,
        );
        push_linear(&mut out, &format!("{attn}.o_proj"), heads * cfg.v_head_dim, hidden, false);

        let mlp = format!("{layer}.mlp");
        match cfg.n_routed_experts {
            Some(n_routed) if cfg.is_moe_layer(i) => {
                push_linear(&mut out, &format!("{mlp}.gate"), hidden, n_routed, false);
                for e in 0..n_routed {
                    push_ffn(&mut out, &format!("{mlp}.experts.{e}"), hidden, cfg.moe_intermediate_size);
                }
                if let Some(n_shared) = cfg.n_shared_experts {
                    push_ffn(
                        &mut out,
                        &format!("{mlp}.shared_experts"),
                        hidden,
                        cfg.moe_intermediate_size * n_shared,
                    );
                }
            }
            _ => push_ffn(&mut out, &mlp, hidden, cfg.intermediate_size),
        }
    }

    out.push(("model.norm.weight".to_string(), vec![hidden]));
    out.push(("lm_head.weight".to_string(), vec![cfg.vocab_size, hidden]));
    out
}
