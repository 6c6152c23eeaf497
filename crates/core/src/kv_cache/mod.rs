//! Paged latent KV cache.
//!
//! Each decoder layer owns one [`LayerKvCache`] pair of block tensors. Tokens
//! are addressed by flat slot (`block_id * block_size + offset`); a
//! [`BlockTable`] maps a sequence's positions to slots. Block allocation and
//! eviction belong to the serving layer.

mod block_table;
pub mod config;
mod error;
mod latent_cache;

pub use block_table::BlockTable;
pub use config::LatentCacheConfig;
pub use error::CacheError;
pub use latent_cache::{allocate_layer_caches, LayerKvCache};

/// Physical block index into a layer's cache tensors.
pub type BlockId = usize;
