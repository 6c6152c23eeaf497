//! Quantization mode and the quantized linear trait.

use candle_core::{DType, Result, Tensor};
use serde::Deserialize;

/// Weight quantization of a checkpoint, as named in `config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum QuantizeMode {
    #[serde(rename = "awq")]
    Awq,
    #[serde(rename = "eetq")]
    Eetq,
    #[serde(rename = "exl2")]
    Exl2,
    #[serde(rename = "gptq")]
    Gptq,
    #[serde(rename = "marlin")]
    Marlin,
    #[serde(rename = "bitsandbytes")]
    BitsAndBytes,
    #[serde(rename = "bitsandbytes-nf4")]
    BitsAndBytesNf4,
    #[serde(rename = "bitsandbytes-fp4")]
    BitsAndBytesFp4,
    #[serde(rename = "fp8")]
    Fp8,
}

impl QuantizeMode {
    /// Packed formats whose expert tensors cannot be loaded per expert.
    pub fn is_packed_int4(&self) -> bool {
        matches!(self, Self::Gptq | Self::Awq)
    }
}

impl std::fmt::Display for QuantizeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Awq => "awq",
            Self::Eetq => "eetq",
            Self::Exl2 => "exl2",
            Self::Gptq => "gptq",
            Self::Marlin => "marlin",
            Self::BitsAndBytes => "bitsandbytes",
            Self::BitsAndBytesNf4 => "bitsandbytes-nf4",
            Self::BitsAndBytesFp4 => "bitsandbytes-fp4",
            Self::Fp8 => "fp8",
        };
        f.write_str(name)
    }
}

/// A linear layer whose weight is stored in a quantized format.
///
/// Implementations hold one shard's slice and never communicate; sharding
/// and bias are handled by the owning [`crate::layers::ShardedLinear`].
pub trait QuantizedLinear: Send + Sync + std::fmt::Debug {
    /// `x @ dequant(w)^T`, computed in the activation dtype of `x`.
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Storage dtype of the quantized weight.
    fn weight_dtype(&self) -> DType;

    fn in_features(&self) -> usize;

    fn out_features(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names_round_trip_through_display() {
        for name in [
            "awq",
            "eetq",
            "exl2",
            "gptq",
            "marlin",
            "bitsandbytes",
            "bitsandbytes-nf4",
            "bitsandbytes-fp4",
            "fp8",
        ] {
            let mode: QuantizeMode = serde_json::from_str(&format!("\"{name}\"")).unwrap();
            assert_eq!(mode.to_string(), name);
        }
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(serde_json::from_str::<QuantizeMode>("\"int3\"").is_err());
    }

    #[test]
    fn packed_int4_modes() {
        assert!(QuantizeMode::Gptq.is_packed_int4());
        assert!(QuantizeMode::Awq.is_packed_int4());
        assert!(!QuantizeMode::Eetq.is_packed_int4());
    }
}
