pub mod deepseek_v2;
pub mod head;
pub mod layout;

pub use deepseek_v2::{
    DecoderLayer, DeepseekV2ForCausalLM, DeepseekV2Model, FeedForward, SparseMoeBlock,
};
pub use head::{CausalLMHead, LinearLmHead};
pub use layout::expected_tensors;
