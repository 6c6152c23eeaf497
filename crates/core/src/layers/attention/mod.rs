//! Attention for the latent-attention decoder.
//!
//! - [`MlaAttention`]: the per-layer attention block
//! - [`BatchMetadata`]: how the flat token batch maps onto sequences and slots
//! - [`ops`]: reference kernels (varlen causal prefill, single-query decode)

mod metadata;
mod mla;
pub mod ops;

pub use metadata::BatchMetadata;
pub use mla::MlaAttention;
pub use ops::{causal_mask, single_query_attention, varlen_causal_attention};
