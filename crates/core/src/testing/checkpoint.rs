use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DeepseekV2Config;
use crate::models::layout::expected_tensors;

/// Deterministic random checkpoint holding every tensor the model requests.
///
/// Same `seed` gives the same weights on every thread, so sharded replicas
/// can each load "the same checkpoint". Norm weights are drawn around 1,
/// matrices uniformly in `±1/sqrt(fan_in)`.
pub fn random_checkpoint(cfg: &DeepseekV2Config, seed: u64, device: &Device) -> HashMap<String, Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensors = HashMap::new();
    for (name, shape) in expected_tensors(cfg) {
        let numel: usize = shape.iter().product();
        let is_norm = name.ends_with("norm.weight");
        let bound = match shape.as_slice() {
            [_, fan_in] if !name.ends_with("embed_tokens.weight") => 1.0 / (*fan_in as f32).sqrt(),
            _ => 1.0,
        };
        let data: Vec<f32> = (0..numel)
            .map(|_| {
                if is_norm {
                    1.0 + rng.gen_range(-0.1f32..0.1)
                } else {
                    rng.gen_range(-bound..bound)
                }
            })
            .collect();
        let tensor = Tensor::from_vec(data, shape.as_slice(), device)
            .unwrap_or_else(|e| panic!("failed to build test tensor {name}: {e}"));
        tensors.insert(name, tensor);
    }
    tensors
}

/// [`random_checkpoint`] wrapped in a `VarBuilder` rooted at the checkpoint
/// top level (`model.*`, `lm_head.*`).
pub fn random_var_builder(cfg: &DeepseekV2Config, seed: u64, device: &Device) -> VarBuilder<'static> {
    VarBuilder::from_tensors(random_checkpoint(cfg, seed, device), DType::F32, device)
}
