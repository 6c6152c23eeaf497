//! Weight quantization for linear operators.
//!
//! - [`QuantizeMode`]: the checkpoint's quantization, from `config.json`
//! - [`QuantizedLinear`]: trait for quantized matmuls
//! - [`Int8Linear`]: per-channel INT8 weight-only kernel (CPU reference)
//!
//! Only `eetq` has a kernel in this crate. Every other mode is rejected at
//! construction so a checkpoint never runs with silently wrong weights.

mod config;
mod int8;

pub use config::{QuantizeMode, QuantizedLinear};
pub use int8::{quantize_to_int8, Int8Linear};

use candle_core::Tensor;

use crate::error::{ModelError, Result};

/// Build the quantized kernel for one shard's `[out, in]` weight slice.
pub fn create_quantized_linear(
    mode: QuantizeMode,
    weight: &Tensor,
) -> Result<Box<dyn QuantizedLinear>> {
    match mode {
        QuantizeMode::Eetq => Ok(Box::new(Int8Linear::from_weight(weight)?)),
        other => Err(ModelError::config(format!(
            "no kernel available for {other} quantized linear layers"
        ))),
    }
}

/// Experts are loaded one weight at a time; packed int4 formats store them
/// in a layout that cannot be split that way.
pub fn check_expert_quantization(mode: Option<QuantizeMode>) -> Result<()> {
    match mode {
        Some(m) if m.is_packed_int4() => Err(ModelError::config(format!(
            "{m} quantization is not supported for expert loading"
        ))),
        _ => Ok(()),
    }
}
