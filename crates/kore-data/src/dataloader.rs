//! DataLoader: batched iteration over a [`Dataset`] in collated containers.

use std::cell::Cell;

use kore_tensordict::TensorDict;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::collate::collate;
use crate::config::LoaderConfig;
use crate::dataset::Dataset;
use crate::error::Result;

/// Batched, optionally shuffled iteration over a `Dataset`.
///
/// Each batch is the [`collate`] of its samples, so a dataset of samples with
/// batch size `S` yields containers with batch size `[B] + S`.
///
/// # Example (Rust)
/// ```ignore
/// use kore_data::{DataLoader, LoaderConfig, TensorDictDataset};
///
/// let ds = TensorDictDataset::from_tensors([("input", x), ("target", y)])?;
/// let loader = DataLoader::new(Box::new(ds), LoaderConfig::new(32).with_shuffle(Some(42)))?;
///
/// for batch in loader.iter() {
///     let batch = batch?;
///     // batch.get_tensor("input")?: [32, 16]
/// }
/// ```
pub struct DataLoader {
    dataset: Box<dyn Dataset>,
    config: LoaderConfig,
    epoch_counter: Cell<u64>,
}

impl DataLoader {
    pub fn new(dataset: Box<dyn Dataset>, config: LoaderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dataset,
            config,
            epoch_counter: Cell::new(0),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Number of batches per epoch.
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.config.drop_last {
            n / self.config.batch_size
        } else {
            n.div_ceil(self.config.batch_size)
        }
    }

    pub fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    /// Current epoch counter (incremented by each shuffled `iter()` call).
    pub fn epoch(&self) -> u64 {
        self.epoch_counter.get()
    }

    /// Set the epoch counter (useful when resuming training).
    pub fn set_epoch(&self, epoch: u64) {
        self.epoch_counter.set(epoch);
    }

    /// Iterator over the batches of one epoch.
    pub fn iter(&self) -> DataLoaderIter<'_> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();

        if self.config.shuffle {
            let epoch = self.epoch_counter.get();
            self.epoch_counter.set(epoch + 1);
            match self.config.seed {
                // seed + epoch: a new order every epoch, reproducible across runs
                Some(seed) => indices.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(epoch))),
                None => indices.shuffle(&mut rand::thread_rng()),
            }
        }
        debug!(
            samples = indices.len(),
            batches = self.num_batches(),
            shuffle = self.config.shuffle,
            "starting epoch"
        );

        DataLoaderIter {
            loader: self,
            indices,
            pos: 0,
        }
    }
}

impl<'a> IntoIterator for &'a DataLoader {
    type Item = Result<TensorDict>;
    type IntoIter = DataLoaderIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over DataLoader batches.
pub struct DataLoaderIter<'a> {
    loader: &'a DataLoader,
    indices: Vec<usize>,
    pos: usize,
}

impl DataLoaderIter<'_> {
    /// Sample order of this epoch.
    pub fn order(&self) -> &[usize] {
        &self.indices
    }
}

impl Iterator for DataLoaderIter<'_> {
    type Item = Result<TensorDict>;

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.indices.len();
        if self.pos >= n {
            return None;
        }

        let batch_size = self.loader.config.batch_size;
        let end = (self.pos + batch_size).min(n);
        if self.loader.config.drop_last && end - self.pos < batch_size {
            self.pos = n;
            return None;
        }

        let picks = &self.indices[self.pos..end];
        self.pos = end;
        let samples = match picks
            .iter()
            .map(|&i| self.loader.dataset.get(i))
            .collect::<Result<Vec<_>>>()
        {
            Ok(samples) => samples,
            Err(e) => return Some(Err(e)),
        };
        Some(collate(&samples))
    }
}
