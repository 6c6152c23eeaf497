use super::error::CacheError;
use super::BlockId;

/// Per-sequence mapping: logical block index → physical `BlockId`.
///
/// Callers use it to build the `slots` and `block_tables` of a batch.
#[derive(Debug, Clone)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
    num_tokens_stored: usize,
    block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            num_tokens_stored: 0,
            block_size,
        }
    }

    /// Rebuild a table from known block IDs and stored token count.
    pub fn from_block_ids(blocks: Vec<BlockId>, num_tokens_stored: usize, block_size: usize) -> Self {
        Self {
            blocks,
            num_tokens_stored,
            block_size,
        }
    }

    /// Total tokens currently stored.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens_stored
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// How many new blocks are needed to store `new_tokens` additional tokens.
    pub fn blocks_needed(&self, new_tokens: usize) -> usize {
        if new_tokens == 0 {
            return 0;
        }
        let total_after = self.num_tokens_stored + new_tokens;
        total_after
            .div_ceil(self.block_size)
            .saturating_sub(self.blocks.len())
    }

    /// Append newly allocated block IDs.
    pub fn append_blocks(&mut self, block_ids: &[BlockId]) {
        self.blocks.extend_from_slice(block_ids);
    }

    /// Advance fill by `n` tokens (after writing to cache).
    pub fn advance(&mut self, n: usize) {
        self.num_tokens_stored += n;
    }

    /// Physical slots for positions `[start_pos, start_pos + n)`.
    pub fn slot_mapping(&self, start_pos: usize, n: usize) -> Result<Vec<usize>, CacheError> {
        let capacity = self.blocks.len() * self.block_size;
        if start_pos + n > capacity {
            return Err(CacheError::LengthExceedsTable {
                length: start_pos + n,
                capacity,
            });
        }
        Ok((start_pos..start_pos + n)
            .map(|pos| self.blocks[pos / self.block_size] * self.block_size + pos % self.block_size)
            .collect())
    }

    /// Ordered physical block IDs.
    pub fn block_ids(&self) -> &[BlockId] {
        &self.blocks
    }
}
