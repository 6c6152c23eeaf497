//! INT8 weight-only quantization (W8A16), used for `quantize = "eetq"`.
//!
//! Weights arrive in full precision and are quantized at load time with
//! per-channel (per-row) symmetric scales: `scale[i] = max(|w[i,:]|) / 127`.
//! Forward dequantizes per channel and multiplies in the activation dtype.

use candle_core::{DType, Result, Tensor};

use super::config::QuantizedLinear;

/// Quantize a weight tensor to INT8 with per-channel scaling.
///
/// Returns `(weight_i8, scale)` where:
/// - `weight_i8` is `[out, in]` with values in `[-127, 127]`
/// - `scale` is `[out]` with the per-channel dequantization scale
pub fn quantize_to_int8(weight: &Tensor) -> Result<(Tensor, Tensor)> {
    let weight_f32 = weight.to_dtype(DType::F32)?;

    let row_max = weight_f32.abs()?.max(1)?;
    let scale = (row_max / 127.0)?;

    // All-zero rows would otherwise divide by zero.
    let epsilon = Tensor::new(&[1e-12f32], scale.device())?;
    let scale = scale.maximum(&epsilon.broadcast_as(scale.shape())?)?;

    let quantized = weight_f32
        .broadcast_div(&scale.unsqueeze(1)?)?
        .round()?
        .clamp(-127.0f64, 127.0f64)?;

    // candle has no native I8
    let weight_i8 = quantized.to_dtype(DType::I64)?;

    Ok((weight_i8, scale))
}

/// INT8 linear layer with per-channel FP32 scales.
///
/// Forward: `y = x @ (w_i8 * scale).to_dtype(x.dtype())^T`
pub struct Int8Linear {
    /// `[out_features, in_features]`, INT8 values stored as I64
    weight_i8: Tensor,
    /// `[out_features]`
    weight_scale: Tensor,
    in_features: usize,
    out_features: usize,
}

impl std::fmt::Debug for Int8Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Int8Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .finish()
    }
}

impl Int8Linear {
    /// Quantize a full-precision `[out, in]` weight.
    pub fn from_weight(weight: &Tensor) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        let (weight_i8, weight_scale) = quantize_to_int8(weight)?;
        Ok(Self {
            weight_i8,
            weight_scale,
            in_features,
            out_features,
        })
    }

    fn dequantize(&self, dtype: DType) -> Result<Tensor> {
        self.weight_i8
            .to_dtype(DType::F32)?
            .broadcast_mul(&self.weight_scale.unsqueeze(1)?)?
            .to_dtype(dtype)
    }
}

impl QuantizedLinear for Int8Linear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.dequantize(x.dtype())?;
        x.broadcast_matmul(&w.t()?)
    }

    fn weight_dtype(&self) -> DType {
        DType::I64
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.out_features
    }
}
