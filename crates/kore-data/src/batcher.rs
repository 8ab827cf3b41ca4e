//! TokenBatcher: padded token batches for sequence models.
//!
//! Converts ragged token sequences into a container with batch size
//! `[batch, seq_len]`, so every per-token field is addressable by the same
//! batch index and `attention_mask` can be used directly as a batch mask.

use kore_core::Tensor;
use kore_tensordict::{TensorDict, TensorDictBase};
use tracing::trace;

use crate::error::{DataError, Result};

/// Label value at positions that carry no prediction target.
pub const IGNORE_INDEX: i64 = -100;

/// Padding strategy for variable-length sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingStrategy {
    /// Pad all sequences to the longest in the batch.
    LongestInBatch,
    /// Pad (or truncate) all sequences to a fixed length.
    Fixed(usize),
    /// All sequences must already have the same length.
    NoPadding,
}

/// Batches token sequences into containers for training and inference.
#[derive(Debug, Clone)]
pub struct TokenBatcher {
    pub padding: PaddingStrategy,
    /// Token ID written at padded positions.
    pub pad_token_id: i64,
}

impl TokenBatcher {
    pub fn new(padding: PaddingStrategy, pad_token_id: i64) -> Self {
        Self {
            padding,
            pad_token_id,
        }
    }

    fn seq_len(&self, sequences: &[Vec<i64>]) -> Result<usize> {
        match self.padding {
            PaddingStrategy::LongestInBatch => {
                Ok(sequences.iter().map(Vec::len).max().unwrap_or(0))
            }
            PaddingStrategy::Fixed(len) => Ok(len),
            PaddingStrategy::NoPadding => {
                let first = sequences.first().map_or(0, Vec::len);
                match sequences.iter().position(|s| s.len() != first) {
                    Some(i) => Err(DataError::InvalidInput(format!(
                        "sequence {i} has length {} but NoPadding needs every sequence at length {first}",
                        sequences[i].len()
                    ))),
                    None => Ok(first),
                }
            }
        }
    }

    /// Container with `input_ids` (i64) and `attention_mask` (bool), both
    /// `[batch, seq_len]`.
    pub fn batch(&self, sequences: &[Vec<i64>]) -> Result<TensorDict> {
        let batch = sequences.len();
        let seq_len = self.seq_len(sequences)?;

        let mut ids = vec![self.pad_token_id; batch * seq_len];
        let mut mask = vec![false; batch * seq_len];
        for (i, seq) in sequences.iter().enumerate() {
            let row = i * seq_len;
            for (j, &token) in seq.iter().take(seq_len).enumerate() {
                ids[row + j] = token;
                mask[row + j] = true;
            }
        }

        let shape = [batch, seq_len];
        let td = TensorDict::new(
            [
                ("input_ids", Tensor::from_i64(&ids, &shape)),
                ("attention_mask", Tensor::from_bool(&mask, &shape)),
            ],
            shape,
            None,
        )?;
        trace!(batch, seq_len, "padded token batch");
        Ok(td)
    }

    /// [`batch`](Self::batch) plus next-token `labels`: the label at `j` is
    /// the token at `j + 1`, and [`IGNORE_INDEX`] where that token is padding
    /// or past the end.
    pub fn batch_with_labels(&self, sequences: &[Vec<i64>]) -> Result<TensorDict> {
        let td = self.batch(sequences)?;
        let (batch, seq_len) = match td.batch_size().dims() {
            &[b, l] => (b, l),
            dims => {
                return Err(DataError::InvalidInput(format!(
                    "expected a [batch, seq_len] container, got {dims:?}"
                )))
            }
        };
        let ids = td.get_tensor("input_ids")?.to_vec_i64();
        let mask = td.get_tensor("attention_mask")?.to_vec_bool();

        let mut labels = vec![IGNORE_INDEX; batch * seq_len];
        for i in 0..batch {
            let row = i * seq_len;
            for j in 1..seq_len {
                if mask[row + j] {
                    labels[row + j - 1] = ids[row + j];
                }
            }
        }
        td.set("labels", Tensor::from_i64(&labels, &[batch, seq_len]))?;
        Ok(td)
    }
}
