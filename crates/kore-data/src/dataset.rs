//! Indexable sources of sample containers.

use kore_core::{Shape, Tensor, TensorIndex};
use kore_tensordict::{TensorDict, TensorDictBase};

use crate::error::{DataError, Result};

/// Trait for indexable datasets.
///
/// Implement this to plug any data source into
/// [`DataLoader`](crate::DataLoader). Samples returned for different indices
/// must share keys and shapes so they can be collated.
pub trait Dataset: Send + Sync {
    /// Total number of samples.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at `index`, as a container with the per-sample batch size.
    fn get(&self, index: usize) -> Result<TensorDict>;
}

/// In-memory dataset whose samples are the rows of one container.
///
/// The container's first batch dimension enumerates the samples; a sample
/// keeps the remaining batch dimensions and aliases the row it came from.
#[derive(Debug, Clone)]
pub struct TensorDictDataset {
    data: TensorDict,
}

impl TensorDictDataset {
    /// Wrap `data`, which needs at least one batch dimension.
    pub fn new(data: TensorDict) -> Result<Self> {
        if data.batch_dims() == 0 {
            return Err(DataError::InvalidInput(
                "dataset container needs a leading sample dimension".into(),
            ));
        }
        Ok(Self { data })
    }

    /// Build from named tensors sharing their first dimension `N`.
    ///
    /// ```ignore
    /// let ds = TensorDictDataset::from_tensors([("input", x), ("target", y)])?;
    /// ```
    pub fn from_tensors<K: Into<String>>(
        tensors: impl IntoIterator<Item = (K, Tensor)>,
    ) -> Result<Self> {
        let tensors: Vec<(K, Tensor)> = tensors.into_iter().collect();
        let n = tensors
            .first()
            .and_then(|(_, t)| t.shape().dims().first().copied())
            .ok_or_else(|| {
                DataError::InvalidInput("need at least one tensor with a sample dimension".into())
            })?;
        let data = TensorDict::new(tensors, Shape::new(&[n]), None)?;
        Self::new(data)
    }

    pub fn data(&self) -> &TensorDict {
        &self.data
    }
}

impl Dataset for TensorDictDataset {
    fn len(&self) -> usize {
        self.data.batch_size().dims().first().copied().unwrap_or(0)
    }

    fn get(&self, index: usize) -> Result<TensorDict> {
        let row = self.data.index(&[TensorIndex::Select(index as isize)])?;
        match row.as_eager() {
            Some(td) => Ok(td.clone()),
            None => Ok(row.materialize()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kore_core::DType;
    use kore_tensordict::TensorDictError;

    fn dataset(n: usize) -> TensorDictDataset {
        TensorDictDataset::from_tensors([
            ("input", Tensor::arange(0.0, (n * 4) as f32, 1.0).reshape(&[n as isize, 4]).unwrap()),
            ("target", Tensor::zeros(&[n], DType::I64)),
        ])
        .unwrap()
    }

    #[test]
    fn test_from_tensors() {
        let ds = dataset(10);
        assert_eq!(ds.len(), 10);
        assert_eq!(ds.data().key_list(), vec!["input", "target"]);
    }

    #[test]
    fn test_sample_aliases_row() {
        let ds = dataset(3);
        let s = ds.get(1).unwrap();
        assert!(s.batch_size().dims().is_empty());
        assert_eq!(s.get_tensor("input").unwrap().to_vec_f32(), vec![4.0, 5.0, 6.0, 7.0]);
        s.fill_("target", 1.0).unwrap();
        assert_eq!(ds.data().get_tensor("target").unwrap().to_vec_i64(), vec![0, 1, 0]);
    }

    #[test]
    fn test_out_of_range_sample() {
        let ds = dataset(3);
        assert!(matches!(
            ds.get(3),
            Err(DataError::Container(TensorDictError::IndexOutOfRange(_)))
        ));
    }

    #[test]
    fn test_len_after_batch_dims_cleared() {
        let ds = dataset(4);
        ds.data().set_batch_size(&[]).unwrap();
        assert_eq!(ds.len(), 0);
        assert!(ds.is_empty());
    }

    #[test]
    fn test_rejects_mismatched_rows() {
        let err = TensorDictDataset::from_tensors([
            ("a", Tensor::ones(&[4, 2])),
            ("b", Tensor::ones(&[3, 2])),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            DataError::Container(TensorDictError::BatchSizeMismatch { .. })
        ));
        assert!(TensorDictDataset::new(TensorDict::empty(Shape::scalar(), None)).is_err());
    }
}
