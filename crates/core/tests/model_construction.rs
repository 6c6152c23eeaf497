//! Construction-time validation and layer layout of the causal LM.

use candle_core::Device;
use deepseek_moe_core::distributed::DeviceContext;
use deepseek_moe_core::models::FeedForward;
use deepseek_moe_core::moe::MoEDispatcher;
use deepseek_moe_core::quantization::QuantizeMode;
use deepseek_moe_core::testing::{random_var_builder, tiny_config};
use deepseek_moe_core::{DeepseekV2Config, DeepseekV2ForCausalLM, ModelError};

fn load(cfg: &DeepseekV2Config) -> Result<DeepseekV2ForCausalLM, ModelError> {
    let vb = random_var_builder(cfg, 5, &Device::Cpu);
    DeepseekV2ForCausalLM::load(cfg, vb, &DeviceContext::single_device())
}

fn assert_config_error(cfg: &DeepseekV2Config, needle: &str) {
    match load(cfg) {
        Err(ModelError::Configuration(msg)) => {
            assert!(msg.contains(needle), "'{msg}' does not mention '{needle}'")
        }
        Err(other) => panic!("expected configuration error, got {other}"),
        Ok(_) => panic!("expected configuration error mentioning '{needle}'"),
    }
}

// ─── Rejected configurations ─────────────────────────────────────────────────

#[test]
fn tied_embeddings() {
    let mut cfg = tiny_config();
    cfg.tie_word_embeddings = true;
    assert_config_error(&cfg, "tie_word_embeddings");
}

#[test]
fn odd_rotary_dimension() {
    let mut cfg = tiny_config();
    cfg.qk_rope_head_dim = 3;
    assert_config_error(&cfg, "rotary dimension");
}

#[test]
fn gptq_and_awq_experts() {
    for mode in [QuantizeMode::Gptq, QuantizeMode::Awq] {
        let mut cfg = tiny_config();
        cfg.quantize = Some(mode);
        let vb = random_var_builder(&cfg, 5, &Device::Cpu);
        let err = MoEDispatcher::load(&cfg, vb.pp("model.layers.1.mlp"), &DeviceContext::single_device())
            .unwrap_err();
        match err {
            ModelError::Configuration(msg) => assert!(msg.contains("expert loading"), "{msg}"),
            other => panic!("expected configuration error, got {other}"),
        }
        // The whole model fails as well, at the first quantized projection.
        assert!(matches!(load(&cfg), Err(ModelError::Configuration(_))));
    }
}

#[test]
fn top_k_above_expert_count() {
    let mut cfg = tiny_config();
    cfg.num_experts_per_tok = Some(5);
    assert_config_error(&cfg, "num_experts_per_tok");
}

#[test]
fn zero_moe_layer_freq() {
    let mut cfg = tiny_config();
    cfg.moe_layer_freq = 0;
    assert_config_error(&cfg, "moe_layer_freq");
}

#[test]
fn unknown_activation() {
    let mut cfg = tiny_config();
    cfg.hidden_act = "swishy".to_string();
    assert_config_error(&cfg, "unknown activation");
}

#[test]
fn quantization_without_kernel() {
    let mut cfg = tiny_config();
    cfg.quantize = Some(QuantizeMode::Fp8);
    assert_config_error(&cfg, "no kernel available");
}

// ─── Layer layout ────────────────────────────────────────────────────────────

fn layer_kinds(cfg: &DeepseekV2Config) -> Vec<&'static str> {
    load(cfg)
        .unwrap()
        .model()
        .layers()
        .iter()
        .map(|l| match l.mlp() {
            FeedForward::Dense(_) => "dense",
            FeedForward::Sparse(_) => "moe",
        })
        .collect()
}

#[test]
fn first_k_dense_replace_and_frequency_select_moe_layers() {
    let mut cfg = tiny_config();
    cfg.num_hidden_layers = 5;
    cfg.first_k_dense_replace = 1;
    cfg.moe_layer_freq = 2;
    assert_eq!(layer_kinds(&cfg), vec!["dense", "dense", "moe", "dense", "moe"]);

    cfg.first_k_dense_replace = 0;
    cfg.moe_layer_freq = 1;
    assert_eq!(layer_kinds(&cfg), vec!["moe"; 5]);
}

#[test]
fn no_routed_experts_means_all_dense() {
    let mut cfg = tiny_config();
    cfg.n_routed_experts = None;
    cfg.num_experts_per_tok = None;
    cfg.n_shared_experts = None;
    assert_eq!(layer_kinds(&cfg), vec!["dense", "dense"]);
}

#[test]
fn config_json_round_trip_loads() {
    let json = r#"{
        "vocab_size": 64, "hidden_size": 32, "intermediate_size": 32,
        "moe_intermediate_size": 16, "num_hidden_layers": 2,
        "num_attention_heads": 4, "n_routed_experts": 4, "n_shared_experts": 1,
        "num_experts_per_tok": 2, "first_k_dense_replace": 1,
        "kv_lora_rank": 16, "q_lora_rank": null, "qk_rope_head_dim": 4,
        "qk_nope_head_dim": 8, "v_head_dim": 8, "max_position_embeddings": 64,
        "rope_scaling": {"type": "yarn", "factor": 2.0, "original_max_position_embeddings": 16,
                         "mscale": 1.0, "mscale_all_dim": 1.0},
        "model_type": "deepseek_v2"
    }"#;
    let cfg: DeepseekV2Config = serde_json::from_str(json).unwrap();
    let lm = load(&cfg).unwrap();
    assert_eq!(lm.model().num_layers(), 2);
    assert_eq!(lm.model().rotary().dim(), 4);
}
