//! Crate-level error taxonomy.
//!
//! Construction-time problems (sharding, quantization, unsupported options)
//! surface as [`ModelError::Configuration`]; tensors that violate a
//! component's contract at call time surface as [`ModelError::ShapeMismatch`].
//! Nothing here is recoverable: a failed forward is reported to the caller as
//! a request-level failure.

use thiserror::Error;

use crate::distributed::DistributedError;
use crate::kv_cache::CacheError;

#[derive(Error, Debug)]
pub enum ModelError {
    /// Invalid or unsupported configuration, detected while building the model.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A tensor or metadata slice does not match the shape a component expects.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Collective failures at forward time. Sharding errors raised while
    /// loading are converted to [`ModelError::Configuration`].
    #[error("distributed error: {0}")]
    Distributed(DistributedError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl ModelError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

impl From<DistributedError> for ModelError {
    fn from(e: DistributedError) -> Self {
        match e {
            DistributedError::IndivisibleShard { .. } | DistributedError::EmptyGroup => {
                Self::Configuration(e.to_string())
            }
            other => Self::Distributed(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
