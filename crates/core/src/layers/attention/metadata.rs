//! Per-forward batch metadata shared by every attention layer.

use crate::error::{ModelError, Result};
use crate::kv_cache::{BlockId, BlockTable};

/// Describes how the flat token batch maps onto sequences and cache slots.
///
/// Prefill when `cu_seqlen_prefill` is set: sequence `i` owns tokens
/// `cu[i]..cu[i+1]`. Decode otherwise: one token per sequence.
#[derive(Debug, Clone, Default)]
pub struct BatchMetadata {
    /// Cumulative sequence boundaries, `[0, len_0, len_0 + len_1, ...]`
    pub cu_seqlen_prefill: Option<Vec<usize>>,
    /// Physical blocks of each sequence, in logical order
    pub block_tables: Vec<Vec<BlockId>>,
    /// Cache slot of every token in the batch
    pub slots: Vec<usize>,
    /// Total length of each sequence including this step's tokens
    pub input_lengths: Vec<usize>,
    /// Upper bound on positions in this batch
    pub max_s: usize,
}

impl BatchMetadata {
    pub fn is_prefill(&self) -> bool {
        self.cu_seqlen_prefill.is_some()
    }

    pub fn num_sequences(&self) -> usize {
        self.input_lengths.len()
    }

    /// Build metadata from block tables that already account for this step's
    /// tokens (`advance` called). `new_tokens[i]` are the trailing positions
    /// of sequence `i` computed in this forward.
    pub fn from_block_tables(
        tables: &[BlockTable],
        new_tokens: &[usize],
        prefill: bool,
    ) -> Result<Self> {
        if tables.len() != new_tokens.len() {
            return Err(ModelError::shape(
                "batch new_tokens",
                &[tables.len()],
                &[new_tokens.len()],
            ));
        }
        let mut slots = Vec::new();
        let mut cu = vec![0usize];
        for (table, &n) in tables.iter().zip(new_tokens) {
            let start = table.num_tokens().checked_sub(n).ok_or_else(|| {
                ModelError::shape("batch new_tokens", &[table.num_tokens()], &[n])
            })?;
            slots.extend(table.slot_mapping(start, n)?);
            cu.push(cu[cu.len() - 1] + n);
        }
        let input_lengths: Vec<usize> = tables.iter().map(BlockTable::num_tokens).collect();
        Ok(Self {
            cu_seqlen_prefill: prefill.then_some(cu),
            block_tables: tables.iter().map(|t| t.block_ids().to_vec()).collect(),
            slots,
            max_s: input_lengths.iter().copied().max().unwrap_or(0),
            input_lengths,
        })
    }

    /// Check the metadata against a batch of `num_tokens` tokens.
    pub fn validate(&self, num_tokens: usize) -> Result<()> {
        if self.slots.len() != num_tokens {
            return Err(ModelError::shape(
                "batch slots",
                &[num_tokens],
                &[self.slots.len()],
            ));
        }
        match &self.cu_seqlen_prefill {
            Some(cu) => {
                let last = cu.last().copied().unwrap_or(0);
                if cu.first() != Some(&0) || last != num_tokens {
                    return Err(ModelError::shape(
                        "cu_seqlen_prefill total",
                        &[num_tokens],
                        &[last],
                    ));
                }
                if cu.windows(2).any(|w| w[1] < w[0]) {
                    return Err(ModelError::config(
                        "cu_seqlen_prefill must be non-decreasing",
                    ));
                }
            }
            None => {
                if self.input_lengths.len() != num_tokens {
                    return Err(ModelError::shape(
                        "decode input_lengths",
                        &[num_tokens],
                        &[self.input_lengths.len()],
                    ));
                }
                if self.block_tables.len() != num_tokens {
                    return Err(ModelError::shape(
                        "decode block_tables",
                        &[num_tokens],
                        &[self.block_tables.len()],
                    ));
                }
            }
        }
        Ok(())
    }
}
