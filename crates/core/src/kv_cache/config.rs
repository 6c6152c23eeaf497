//! Configuration for the latent (MLA) cache.
//!
//! Instead of full per-head K/V, each token stores:
//! - the normalized KV latent `[kv_lora_rank]`
//! - the rotated rope key `[qk_rope_head_dim]`, shared by all heads

use candle_core::{DType, Device};

use crate::config::DeepseekV2Config;

#[derive(Debug, Clone)]
pub struct LatentCacheConfig {
    /// Width of the compressed latent (512 for DeepSeek-V2)
    pub kv_lora_rank: usize,
    /// Width of the rope key (64 for DeepSeek-V2)
    pub qk_rope_head_dim: usize,
    /// Tokens per block
    pub block_size: usize,
    /// Blocks allocated per layer
    pub num_blocks: usize,
    /// One cache pair per decoder layer
    pub num_layers: usize,
    pub dtype: DType,
    pub device: Device,
}

impl LatentCacheConfig {
    /// Cache geometry for `cfg`. The latent is replicated, so every shard
    /// allocates the same sizes.
    pub fn from_model(
        cfg: &DeepseekV2Config,
        block_size: usize,
        num_blocks: usize,
        dtype: DType,
        device: Device,
    ) -> Self {
        Self {
            kv_lora_rank: cfg.kv_lora_rank,
            qk_rope_head_dim: cfg.qk_rope_head_dim,
            block_size,
            num_blocks,
            num_layers: cfg.num_hidden_layers,
            dtype,
            device,
        }
    }

    /// Total addressable slots per layer.
    pub fn num_slots(&self) -> usize {
        self.num_blocks * self.block_size
    }

    /// Bytes stored per token per layer.
    pub fn bytes_per_token(&self) -> usize {
        (self.kv_lora_rank + self.qk_rope_head_dim) * self.dtype.size_in_bytes()
    }

    /// Bytes allocated across all layers.
    pub fn total_bytes(&self) -> usize {
        self.bytes_per_token() * self.num_slots() * self.num_layers
    }
}
