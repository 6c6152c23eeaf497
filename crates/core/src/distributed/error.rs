//! Error types for distributed operations.

use thiserror::Error;

/// Errors that can occur during collective operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// A group needs at least one member.
    #[error("process group must have at least one member")]
    EmptyGroup,

    /// A weight dimension cannot be split evenly across the group.
    #[error("{what} ({size}) must be divisible by world_size ({world_size})")]
    IndivisibleShard {
        what: String,
        size: usize,
        world_size: usize,
    },

    /// Tensor shape mismatch for collective operation.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A peer panicked while holding the shared reduction buffer.
    #[error("communicator state poisoned: {0}")]
    Poisoned(String),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
