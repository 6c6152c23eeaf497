//! Activation selection by Hugging Face `hidden_act` name.

use candle_core::{Module, Tensor};

use crate::error::{ModelError, Result};

/// Element-wise activation used by the gated feed-forward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Silu,
    /// tanh approximation (`gelu_fast`, `gelu_pytorch_tanh`)
    GeluTanh,
    /// exact erf formulation
    GeluErf,
    Other(candle_nn::Activation),
}

impl Activation {
    /// Resolve a `hidden_act` name.
    ///
    /// Any name containing `gelu` is a gelu; only `gelu_fast` and
    /// `gelu_pytorch_tanh` use the tanh approximation. Remaining names go
    /// through candle's activation table.
    pub fn from_name(name: &str) -> Result<Self> {
        if name.contains("gelu") {
            return Ok(match name {
                "gelu_fast" | "gelu_pytorch_tanh" => Self::GeluTanh,
                _ => Self::GeluErf,
            });
        }
        if name == "silu" {
            return Ok(Self::Silu);
        }
        serde_json::from_value::<candle_nn::Activation>(serde_json::Value::String(
            name.to_string(),
        ))
        .map(Self::Other)
        .map_err(|_| ModelError::config(format!("unknown activation '{name}'")))
    }

    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Silu => candle_nn::ops::silu(xs),
            Self::GeluTanh => xs.gelu(),
            Self::GeluErf => xs.gelu_erf(),
            Self::Other(act) => act.forward(xs),
        }
    }
}
