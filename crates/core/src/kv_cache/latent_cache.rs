//! Per-layer latent cache pair.
//!
//! Stores the compressed KV latent and the rope key per token instead of
//! full per-head K/V. Slots are flat: `slot = block_id * block_size + offset`.

use candle_core::Tensor;

use super::config::LatentCacheConfig;
use super::error::CacheError;
use super::BlockId;

type Result<T> = std::result::Result<T, CacheError>;

/// One layer's `(latent_cache, rope_key_cache)` pair.
pub struct LayerKvCache {
    /// `[num_blocks, block_size, kv_lora_rank]`
    latent: Tensor,
    /// `[num_blocks, block_size, qk_rope_head_dim]`
    rope_key: Tensor,
    block_size: usize,
    num_blocks: usize,
}

impl std::fmt::Debug for LayerKvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerKvCache")
            .field("latent", &self.latent.dims())
            .field("rope_key", &self.rope_key.dims())
            .finish()
    }
}

impl LayerKvCache {
    /// Allocate a zeroed cache pair.
    pub fn new(config: &LatentCacheConfig) -> Result<Self> {
        let latent = Tensor::zeros(
            (config.num_blocks, config.block_size, config.kv_lora_rank),
            config.dtype,
            &config.device,
        )?;
        let rope_key = Tensor::zeros(
            (config.num_blocks, config.block_size, config.qk_rope_head_dim),
            config.dtype,
            &config.device,
        )?;
        Ok(Self {
            latent,
            rope_key,
            block_size: config.block_size,
            num_blocks: config.num_blocks,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_slots(&self) -> usize {
        self.num_blocks * self.block_size
    }

    pub fn latent_cache(&self) -> &Tensor {
        &self.latent
    }

    pub fn rope_key_cache(&self) -> &Tensor {
        &self.rope_key
    }

    /// Write `latent [n, kv_lora_rank]` and `rope_key [n, rope_dim]` at `slots`.
    pub fn reshape_and_cache(
        &mut self,
        latent: &Tensor,
        rope_key: &Tensor,
        slots: &[usize],
    ) -> Result<()> {
        let num_tokens = slots.len();
        for (what, t) in [("latent", latent), ("rope_key", rope_key)] {
            let rows = t.dim(0)?;
            if rows != num_tokens {
                return Err(CacheError::RowMismatch {
                    what,
                    expected: num_tokens,
                    actual: rows,
                });
            }
        }
        if num_tokens == 0 {
            return Ok(());
        }
        let num_slots = self.num_slots();
        if let Some(&slot) = slots.iter().find(|&&s| s >= num_slots) {
            return Err(CacheError::SlotOutOfRange { slot, num_slots });
        }

        // Flat views share storage with the caches.
        let latent_dim = self.latent.dim(2)?;
        let rope_dim = self.rope_key.dim(2)?;
        let latent_flat = self.latent.reshape((num_slots, latent_dim))?;
        let rope_flat = self.rope_key.reshape((num_slots, rope_dim))?;

        let slot_ids = Tensor::from_vec(
            slots.iter().map(|&s| s as u32).collect::<Vec<_>>(),
            (num_tokens, 1),
            self.latent.device(),
        )?;

        let latent_src = latent.to_dtype(self.latent.dtype())?.contiguous()?;
        let rope_src = rope_key.to_dtype(self.rope_key.dtype())?.contiguous()?;

        let latent_idx = slot_ids.expand((num_tokens, latent_dim))?.contiguous()?;
        latent_flat.scatter_set(&latent_idx, &latent_src, 0)?;
        let rope_idx = slot_ids.expand((num_tokens, rope_dim))?.contiguous()?;
        rope_flat.scatter_set(&rope_idx, &rope_src, 0)?;

        tracing::trace!(num_tokens, "latent cache write");
        Ok(())
    }

    /// Read the first `length` tokens of a sequence laid out over `block_ids`.
    ///
    /// Returns `(latent [length, kv_lora_rank], rope_key [length, rope_dim])`.
    pub fn gather(&self, block_ids: &[BlockId], length: usize) -> Result<(Tensor, Tensor)> {
        let capacity = block_ids.len() * self.block_size;
        if length > capacity {
            return Err(CacheError::LengthExceedsTable { length, capacity });
        }
        if let Some(&block_id) = block_ids.iter().find(|&&b| b >= self.num_blocks) {
            return Err(CacheError::BlockOutOfRange {
                block_id,
                num_blocks: self.num_blocks,
            });
        }

        let indices = Tensor::from_vec(
            block_ids.iter().map(|&b| b as u32).collect::<Vec<_>>(),
            (block_ids.len(),),
            self.latent.device(),
        )?;

        let latent = self
            .latent
            .index_select(&indices, 0)?
            .reshape((capacity, self.latent.dim(2)?))?
            .narrow(0, 0, length)?;
        let rope_key = self
            .rope_key
            .index_select(&indices, 0)?
            .reshape((capacity, self.rope_key.dim(2)?))?
            .narrow(0, 0, length)?;

        Ok((latent, rope_key))
    }
}

/// One cache pair per decoder layer, in layer order.
pub fn allocate_layer_caches(config: &LatentCacheConfig) -> Result<Vec<LayerKvCache>> {
    (0..config.num_layers)
        .map(|_| LayerKvCache::new(config))
        .collect()
}
