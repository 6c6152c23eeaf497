//! Forward graph of a DeepSeek-V2 style mixture-of-experts decoder.
//!
//! Multi-head latent attention over a paged latent KV cache, routed and
//! shared experts, and tensor-parallel sharded linear operators driven by an
//! explicit [`distributed::DeviceContext`].

pub mod config;
pub mod distributed;
pub mod error;
pub mod kv_cache;
pub mod layers;
pub mod models;
pub mod moe;
pub mod quantization;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{DeepseekV2Config, RopeScaling};
pub use error::{ModelError, Result};
pub use models::{DeepseekV2ForCausalLM, DeepseekV2Model};
