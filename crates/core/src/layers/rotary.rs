//! Rotary position embedding with optional DeepSeek YaRN scaling.
//!
//! The cos/sin tables are precomputed in f32 for every position up to
//! `max_position_embeddings` and stored half-width (`[positions, dim/2]`),
//! the layout candle's `rope` / `rope_i` kernels consume.

use candle_core::{DType, Device, Tensor};

use crate::config::RopeScaling;
use crate::error::{ModelError, Result};

/// `0.1 * m * ln(s) + 1` for `s > 1`, else 1.
pub fn yarn_mscale(scale: f64, mscale: f64) -> f64 {
    if scale <= 1.0 {
        return 1.0;
    }
    0.1 * mscale * scale.ln() + 1.0
}

/// Dimension index at which a frequency completes `num_rotations` over
/// `max_position_embeddings`.
fn yarn_find_correction_dim(
    num_rotations: f64,
    dim: usize,
    base: f64,
    max_position_embeddings: usize,
) -> f64 {
    (dim as f64 * (max_position_embeddings as f64 / (num_rotations * 2.0 * std::f64::consts::PI)).ln())
        / (2.0 * base.ln())
}

fn yarn_find_correction_range(
    low_rot: f64,
    high_rot: f64,
    dim: usize,
    base: f64,
    max_position_embeddings: usize,
) -> (f64, f64) {
    let low = yarn_find_correction_dim(low_rot, dim, base, max_position_embeddings).floor();
    let high = yarn_find_correction_dim(high_rot, dim, base, max_position_embeddings).ceil();
    (low.max(0.0), high.min(dim as f64 - 1.0))
}

/// Ramp from 0 (index <= min) to 1 (index >= max) over `len` entries.
fn yarn_linear_ramp_mask(min: f64, max: f64, len: usize) -> Vec<f64> {
    let max = if min == max { max + 0.001 } else { max };
    (0..len)
        .map(|i| ((i as f64 - min) / (max - min)).clamp(0.0, 1.0))
        .collect()
}

fn inverse_frequencies(dim: usize, base: f64, scaling: Option<&RopeScaling>) -> Vec<f64> {
    let extrapolated: Vec<f64> = (0..dim)
        .step_by(2)
        .map(|i| 1.0 / base.powf(i as f64 / dim as f64))
        .collect();

    let Some(scaling) = scaling.filter(|s| s.is_yarn()) else {
        return extrapolated;
    };

    let (low, high) = yarn_find_correction_range(
        scaling.beta_fast,
        scaling.beta_slow,
        dim,
        base,
        scaling.original_max_position_embeddings,
    );
    let ramp = yarn_linear_ramp_mask(low, high, dim / 2);
    extrapolated
        .iter()
        .zip(ramp)
        .map(|(&extra, ramp)| {
            let inter = extra / scaling.factor;
            let extra_weight = 1.0 - ramp;
            inter * (1.0 - extra_weight) + extra * extra_weight
        })
        .collect()
}

pub struct RotaryEmbedding {
    /// `[max_positions, dim/2]`, f32
    cos: Tensor,
    sin: Tensor,
    dim: usize,
    is_neox_style: bool,
}

impl std::fmt::Debug for RotaryEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotaryEmbedding")
            .field("dim", &self.dim)
            .field("max_positions", &self.max_positions())
            .field("is_neox_style", &self.is_neox_style)
            .finish()
    }
}

impl RotaryEmbedding {
    pub fn new(
        dim: usize,
        max_position_embeddings: usize,
        base: f64,
        scaling: Option<&RopeScaling>,
        is_neox_style: bool,
        device: &Device,
    ) -> Result<Self> {
        if dim == 0 || dim % 2 != 0 {
            return Err(ModelError::config(format!(
                "rotary dimension must be even and non-zero, got {dim}"
            )));
        }

        let inv_freq = inverse_frequencies(dim, base, scaling);
        let mscale = match scaling.filter(|s| s.is_yarn()) {
            Some(s) => yarn_mscale(s.factor, s.mscale) / yarn_mscale(s.factor, s.mscale_all_dim),
            None => 1.0,
        };

        let half = dim / 2;
        let mut cos = Vec::with_capacity(max_position_embeddings * half);
        let mut sin = Vec::with_capacity(max_position_embeddings * half);
        for pos in 0..max_position_embeddings {
            for &f in &inv_freq {
                let angle = pos as f64 * f;
                cos.push((angle.cos() * mscale) as f32);
                sin.push((angle.sin() * mscale) as f32);
            }
        }

        tracing::debug!(dim, max_position_embeddings, mscale, "rotary embedding");
        Ok(Self {
            cos: Tensor::from_vec(cos, (max_position_embeddings, half), device)?,
            sin: Tensor::from_vec(sin, (max_position_embeddings, half), device)?,
            dim,
            is_neox_style,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn max_positions(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Rows of the cos/sin tables for `position_ids [n]`, as `[n, dim/2]`.
    ///
    /// Every position must be below `max_s`, which itself may not exceed the
    /// precomputed table.
    pub fn get_cos_sin(
        &self,
        position_ids: &Tensor,
        max_s: usize,
        dtype: DType,
    ) -> Result<(Tensor, Tensor)> {
        if max_s > self.max_positions() {
            return Err(ModelError::shape(
                "rotary max_s",
                &[self.max_positions()],
                &[max_s],
            ));
        }
        let position_ids = position_ids.to_dtype(DType::U32)?;
        let positions = position_ids.to_vec1::<u32>()?;
        if let Some(&pos) = positions.iter().find(|&&p| p as usize >= max_s) {
            return Err(ModelError::shape(
                "rotary position",
                &[max_s],
                &[pos as usize],
            ));
        }

        let cos = self.cos.index_select(&position_ids, 0)?.to_dtype(dtype)?;
        let sin = self.sin.index_select(&position_ids, 0)?.to_dtype(dtype)?;
        Ok((cos, sin))
    }

    /// Rotate `q [n, heads, dim]` and `k [n, kv_heads, dim]`.
    pub fn apply(
        &self,
        q: &Tensor,
        k: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        Ok((self.rotate(q, cos, sin)?, self.rotate(k, cos, sin)?))
    }

    fn rotate(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let (_n, _heads, dim) = x.dims3()?;
        if dim != self.dim {
            return Err(ModelError::shape("rotary input", &[self.dim], &[dim]));
        }
        // [n, heads, dim] -> [1, heads, n, dim]
        let x = x.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;
        let rotated = if self.is_neox_style {
            candle_nn::rotary_emb::rope(&x, cos, sin)?
        } else {
            candle_nn::rotary_emb::rope_i(&x, cos, sin)?
        };
        Ok(rotated.squeeze(0)?.transpose(0, 1)?.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(p: &[u32]) -> Tensor {
        Tensor::new(p, &Device::Cpu).unwrap()
    }

    fn yarn(factor: f64, mscale: f64, mscale_all_dim: f64) -> RopeScaling {
        RopeScaling {
            kind: "yarn".to_string(),
            factor,
            original_max_position_embeddings: 64,
            beta_fast: 32.0,
            beta_slow: 1.0,
            mscale,
            mscale_all_dim,
        }
    }

    #[test]
    fn odd_dim_is_rejected() {
        let err = RotaryEmbedding::new(7, 16, 10000.0, None, false, &Device::Cpu).unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));
    }

    #[test]
    fn cos_sin_shape_and_determinism() {
        let rope = RotaryEmbedding::new(8, 32, 10000.0, None, false, &Device::Cpu).unwrap();
        let pos = positions(&[0, 5, 3]);
        let (cos_a, sin_a) = rope.get_cos_sin(&pos, 32, DType::F32).unwrap();
        let (cos_b, sin_b) = rope.get_cos_sin(&pos, 32, DType::F32).unwrap();
        assert_eq!(cos_a.dims(), &[3, 4]);
        assert_eq!(cos_a.to_vec2::<f32>().unwrap(), cos_b.to_vec2::<f32>().unwrap());
        assert_eq!(sin_a.to_vec2::<f32>().unwrap(), sin_b.to_vec2::<f32>().unwrap());

        // Position 0 is the identity rotation.
        let cos = cos_a.to_vec2::<f32>().unwrap();
        assert!(cos[0].iter().all(|&c| (c - 1.0).abs() < 1e-6));
    }

    #[test]
    fn inverse_frequency_formula() {
        let rope = RotaryEmbedding::new(4, 4, 10000.0, None, true, &Device::Cpu).unwrap();
        let (cos, _) = rope.get_cos_sin(&positions(&[1]), 4, DType::F32).unwrap();
        let cos = cos.to_vec2::<f32>().unwrap();
        // inv_freq = [1, 1/100]
        assert!((cos[0][0] - 1.0f32.cos()).abs() < 1e-6);
        assert!((cos[0][1] - 0.01f32.cos()).abs() < 1e-6);
    }

    #[test]
    fn position_at_or_past_max_s_is_shape_error() {
        let rope = RotaryEmbedding::new(8, 32, 10000.0, None, false, &Device::Cpu).unwrap();
        let err = rope
            .get_cos_sin(&positions(&[1, 4]), 4, DType::F32)
            .unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));
        assert!(rope.get_cos_sin(&positions(&[0]), 33, DType::F32).is_err());
    }

    #[test]
    fn apply_preserves_shape_and_norm() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(8, 16, 10000.0, None, false, &device).unwrap();
        let (cos, sin) = rope.get_cos_sin(&positions(&[0, 1, 2]), 16, DType::F32).unwrap();
        let q = Tensor::randn(0f32, 1.0, (3, 4, 8), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (3, 1, 8), &device).unwrap();
        let (q_rot, k_rot) = rope.apply(&q, &k, &cos, &sin).unwrap();
        assert_eq!(q_rot.dims(), &[3, 4, 8]);
        assert_eq!(k_rot.dims(), &[3, 1, 8]);

        let norm = |t: &Tensor| -> f32 { t.sqr().unwrap().sum_all().unwrap().to_scalar().unwrap() };
        assert!((norm(&q) - norm(&q_rot)).abs() < 1e-3);

        // Token at position 0 is unrotated.
        let q0: Vec<f32> = q.get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let r0: Vec<f32> = q_rot.get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in q0.iter().zip(r0.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn interleaved_pairs_adjacent_elements() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(4, 4, 10000.0, None, false, &device).unwrap();
        let (cos, sin) = rope.get_cos_sin(&positions(&[1]), 4, DType::F32).unwrap();
        let x = Tensor::new(&[[[1.0f32, 0.0, 0.0, 0.0]]], &device).unwrap();
        let (r, _) = rope.apply(&x, &x, &cos, &sin).unwrap();
        let r: Vec<f32> = r.flatten_all().unwrap().to_vec1().unwrap();
        // (x0, x1) rotated by angle 1
        assert!((r[0] - 1.0f32.cos()).abs() < 1e-6);
        assert!((r[1] - 1.0f32.sin()).abs() < 1e-6);
        assert_eq!(r[2], 0.0);
    }

    #[test]
    fn yarn_mscale_values() {
        assert_eq!(yarn_mscale(1.0, 0.707), 1.0);
        assert!((yarn_mscale(40.0, 1.0) - (0.1 * 40f64.ln() + 1.0)).abs() < 1e-12);
    }

    #[test]
    fn yarn_scales_low_frequencies_only() {
        let device = Device::Cpu;
        let plain = inverse_frequencies(16, 10000.0, None);
        let scaled = inverse_frequencies(16, 10000.0, Some(&yarn(4.0, 1.0, 1.0)));
        // Highest frequency is extrapolated unchanged, lowest is interpolated.
        assert!((plain[0] - scaled[0]).abs() < 1e-12);
        assert!((plain[7] / 4.0 - scaled[7]).abs() < 1e-12);

        // mscale == mscale_all_dim cancels in the table.
        let rope = RotaryEmbedding::new(16, 8, 10000.0, Some(&yarn(4.0, 1.0, 1.0)), false, &device)
            .unwrap();
        let (cos, _) = rope.get_cos_sin(&positions(&[0]), 8, DType::F32).unwrap();
        assert!(cos.to_vec2::<f32>().unwrap()[0].iter().all(|&c| (c - 1.0).abs() < 1e-6));
    }
}
