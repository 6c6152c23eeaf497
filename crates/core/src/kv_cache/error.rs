use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("slot {slot} out of range for cache with {num_slots} slots")]
    SlotOutOfRange { slot: usize, num_slots: usize },

    #[error("block {block_id} out of range for cache with {num_blocks} blocks")]
    BlockOutOfRange { block_id: usize, num_blocks: usize },

    #[error("length {length} exceeds block table capacity {capacity}")]
    LengthExceedsTable { length: usize, capacity: usize },

    #[error("cache write mismatch: {what} has {actual} rows, expected {expected}")]
    RowMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
