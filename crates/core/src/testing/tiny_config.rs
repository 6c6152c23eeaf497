use crate::config::DeepseekV2Config;

/// Tiny DeepSeek-V2 style config for tests: 2 layers, 32 hidden, 4 heads.
///
/// Layer 0 is a dense MLP (`first_k_dense_replace = 1`), layer 1 is MoE with
/// 4 routed experts (top-2) and one shared expert. Direct `q_proj` query path.
pub fn tiny_config() -> DeepseekV2Config {
    DeepseekV2Config {
        vocab_size: 64,
        hidden_size: 32,
        intermediate_size: 32,
        moe_intermediate_size: 16,
        num_hidden_layers: 2,
        num_attention_heads: 4,
        num_key_value_heads: Some(4),
        n_shared_experts: Some(1),
        n_routed_experts: Some(4),
        routed_scaling_factor: 1.0,
        kv_lora_rank: 16,
        q_lora_rank: None,
        qk_rope_head_dim: 4,
        v_head_dim: 8,
        qk_nope_head_dim: 8,
        num_experts_per_tok: Some(2),
        moe_layer_freq: 1,
        first_k_dense_replace: 1,
        norm_topk_prob: false,
        hidden_act: "silu".to_string(),
        max_position_embeddings: 64,
        rms_norm_eps: 1e-6,
        rope_theta: 10000.0,
        ..Default::default()
    }
}
