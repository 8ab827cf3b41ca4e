//! # kore-data
//!
//! Data loading and batching for Kore tensor containers.
//!
//! Every batch is a [`TensorDict`](kore_tensordict::TensorDict) whose leading
//! batch dimension indexes the samples:
//! - [`collate`]: stack sample containers along a new dimension 0
//! - [`TensorDictDataset`]: samples as rows of a container with batch `[N]`
//! - [`DataLoader`]: shuffled, seeded iteration in collated batches
//! - [`TokenBatcher`]: pad ragged token sequences into a `[B, L]` container

pub mod batcher;
pub mod collate;
pub mod config;
pub mod dataloader;
pub mod dataset;
pub mod error;

pub use batcher::{PaddingStrategy, TokenBatcher};
pub use collate::collate;
pub use config::LoaderConfig;
pub use dataloader::{DataLoader, DataLoaderIter};
pub use dataset::{Dataset, TensorDictDataset};
pub use error::{DataError, Result};
