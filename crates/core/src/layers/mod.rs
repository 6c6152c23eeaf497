pub mod activation;
pub mod attention;
pub mod linear;
pub mod mlp;
pub mod normalization;
pub mod rotary;

pub use activation::Activation;
pub use attention::{BatchMetadata, MlaAttention};
pub use linear::ShardedLinear;
pub use mlp::ExpertFfn;
pub use normalization::{rms_norm, RmsNorm};
pub use rotary::{yarn_mscale, RotaryEmbedding};
