use serde::Deserialize;

use crate::error::{ModelError, Result};
use crate::quantization::QuantizeMode;

/// Rotary scaling block of a DeepSeek `config.json`.
///
/// Only `type = "yarn"` changes the frequencies; any other type is carried
/// through and treated as plain RoPE.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RopeScaling {
    #[serde(rename = "type", alias = "rope_type")]
    pub kind: String,
    pub factor: f64,
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
    #[serde(default = "default_beta_fast")]
    pub beta_fast: f64,
    #[serde(default = "default_beta_slow")]
    pub beta_slow: f64,
    #[serde(default = "default_mscale")]
    pub mscale: f64,
    #[serde(default)]
    pub mscale_all_dim: f64,
}

impl RopeScaling {
    pub fn is_yarn(&self) -> bool {
        self.kind == "yarn"
    }
}

/// Hugging Face configuration of a DeepSeek-V2 style model.
///
/// Field defaults follow the reference 236B checkpoint; unknown keys are kept
/// in `extra`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeepseekV2Config {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_moe_intermediate_size")]
    pub moe_intermediate_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub n_shared_experts: Option<usize>,
    #[serde(default)]
    pub n_routed_experts: Option<usize>,
    #[serde(default = "default_routed_scaling_factor")]
    pub routed_scaling_factor: f64,
    #[serde(default = "default_kv_lora_rank")]
    pub kv_lora_rank: usize,
    #[serde(default = "default_q_lora_rank")]
    pub q_lora_rank: Option<usize>,
    #[serde(default = "default_qk_rope_head_dim")]
    pub qk_rope_head_dim: usize,
    #[serde(default = "default_v_head_dim")]
    pub v_head_dim: usize,
    #[serde(default = "default_qk_nope_head_dim")]
    pub qk_nope_head_dim: usize,
    #[serde(default)]
    pub num_experts_per_tok: Option<usize>,
    #[serde(default = "default_moe_layer_freq")]
    pub moe_layer_freq: usize,
    #[serde(default)]
    pub first_k_dense_replace: usize,
    #[serde(default)]
    pub norm_topk_prob: bool,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Weight quantization of the checkpoint; `None` means full precision.
    #[serde(default)]
    pub quantize: Option<QuantizeMode>,
    /// Lp order used to renormalize dense-loop gate weights.
    #[serde(default)]
    pub moe_normalize_expert_weights: Option<f64>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_vocab_size() -> usize {
    102400
}
fn default_hidden_size() -> usize {
    4096
}
fn default_intermediate_size() -> usize {
    11008
}
fn default_moe_intermediate_size() -> usize {
    1407
}
fn default_num_hidden_layers() -> usize {
    30
}
fn default_num_attention_heads() -> usize {
    32
}
fn default_routed_scaling_factor() -> f64 {
    1.0
}
fn default_kv_lora_rank() -> usize {
    512
}
fn default_q_lora_rank() -> Option<usize> {
    Some(1536)
}
fn default_qk_rope_head_dim() -> usize {
    64
}
fn default_v_head_dim() -> usize {
    128
}
fn default_qk_nope_head_dim() -> usize {
    128
}
fn default_moe_layer_freq() -> usize {
    1
}
fn default_hidden_act() -> String {
    "silu".to_string()
}
fn default_max_position_embeddings() -> usize {
    2048
}
fn default_rms_norm_eps() -> f64 {
    1e-6
}
fn default_rope_theta() -> f64 {
    10000.0
}
fn default_original_max_position_embeddings() -> usize {
    4096
}
fn default_beta_fast() -> f64 {
    32.0
}
fn default_beta_slow() -> f64 {
    1.0
}
fn default_mscale() -> f64 {
    1.0
}

impl Default for DeepseekV2Config {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            intermediate_size: default_intermediate_size(),
            moe_intermediate_size: default_moe_intermediate_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            num_key_value_heads: None,
            n_shared_experts: None,
            n_routed_experts: None,
            routed_scaling_factor: default_routed_scaling_factor(),
            kv_lora_rank: default_kv_lora_rank(),
            q_lora_rank: default_q_lora_rank(),
            qk_rope_head_dim: default_qk_rope_head_dim(),
            v_head_dim: default_v_head_dim(),
            qk_nope_head_dim: default_qk_nope_head_dim(),
            num_experts_per_tok: None,
            moe_layer_freq: default_moe_layer_freq(),
            first_k_dense_replace: 0,
            norm_topk_prob: false,
            hidden_act: default_hidden_act(),
            max_position_embeddings: default_max_position_embeddings(),
            rms_norm_eps: default_rms_norm_eps(),
            rope_theta: default_rope_theta(),
            rope_scaling: None,
            attention_bias: false,
            tie_word_embeddings: false,
            quantize: None,
            moe_normalize_expert_weights: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl DeepseekV2Config {
    /// Per-head width of queries and keys (`nope + rope`).
    pub fn qk_head_dim(&self) -> usize {
        self.qk_nope_head_dim + self.qk_rope_head_dim
    }

    /// Routed experts per token, defaulting to all of them.
    pub fn top_k(&self) -> usize {
        self.num_experts_per_tok
            .or(self.n_routed_experts)
            .unwrap_or(0)
    }

    /// Lp order applied to dense-loop gate weights.
    pub fn dense_norm_p(&self) -> Option<f64> {
        match self.moe_normalize_expert_weights {
            Some(p) => Some(p),
            None if self.norm_topk_prob => Some(1.0),
            None => None,
        }
    }

    /// Whether decoder layer `layer_idx` uses the MoE feed-forward.
    pub fn is_moe_layer(&self, layer_idx: usize) -> bool {
        self.n_routed_experts.is_some()
            && layer_idx >= self.first_k_dense_replace
            && self.moe_layer_freq != 0
            && layer_idx % self.moe_layer_freq == 0
    }

    /// Reject combinations the forward graph cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.num_attention_heads == 0 {
            return Err(ModelError::config(
                "hidden_size and num_attention_heads must be non-zero",
            ));
        }
        if self.moe_layer_freq == 0 {
            return Err(ModelError::config("moe_layer_freq must be >= 1"));
        }
        if let Some(n_routed) = self.n_routed_experts {
            let top_k = self.top_k();
            if top_k == 0 || top_k > n_routed {
                return Err(ModelError::config(format!(
                    "num_experts_per_tok ({top_k}) must be in 1..={n_routed}"
                )));
            }
        }
        if let Some(p) = self.moe_normalize_expert_weights {
            if p.is_nan() || p <= 0.0 {
                return Err(ModelError::config(format!(
                    "moe_normalize_expert_weights ({p}) must be positive"
                )));
            }
        }
        Ok(())
    }
}
