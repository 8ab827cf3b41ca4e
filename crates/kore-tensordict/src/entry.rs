use kore_core::{DType, Device, Shape, StorageMode, Tensor, TensorIndex};

use crate::any::AnyTensorDict;
use crate::base::TensorDictBase;
use crate::error::{Result, TensorDictError};
use crate::lazy::{LazyStackedTensorDict, PermutedTensorDict, UnsqueezedTensorDict, ViewedTensorDict};
use crate::sub::SubTensorDict;
use crate::tensordict::TensorDict;

/// A value held under one key: a leaf tensor or a nested container.
///
/// Every recursive algorithm (validation, stacking, indexing) switches on
/// this tag explicitly.
#[derive(Debug, Clone)]
pub enum Entry {
    Tensor(Tensor),
    Nested(AnyTensorDict),
}

impl Entry {
    pub(crate) const TENSOR: &'static str = "tensor";
    pub(crate) const NESTED: &'static str = "tensordict";

    pub fn kind_name(&self) -> &'static str {
        match self {
            Entry::Tensor(_) => Self::TENSOR,
            Entry::Nested(_) => Self::NESTED,
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Entry::Tensor(_))
    }

    pub fn is_nested(&self) -> bool {
        matches!(self, Entry::Nested(_))
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Entry::Tensor(t) => Some(t),
            Entry::Nested(_) => None,
        }
    }

    pub fn as_nested(&self) -> Option<&AnyTensorDict> {
        match self {
            Entry::Nested(td) => Some(td),
            Entry::Tensor(_) => None,
        }
    }

    /// The leaf tensor, or `KindMismatch` naming `key`.
    pub fn into_tensor(self, key: &str) -> Result<Tensor> {
        match self {
            Entry::Tensor(t) => Ok(t),
            other => Err(TensorDictError::KindMismatch {
                key: key.to_string(),
                expected: Self::TENSOR,
                found: other.kind_name(),
            }),
        }
    }

    /// The nested container, or `KindMismatch` naming `key`.
    pub fn into_nested(self, key: &str) -> Result<AnyTensorDict> {
        match self {
            Entry::Nested(td) => Ok(td),
            other => Err(TensorDictError::KindMismatch {
                key: key.to_string(),
                expected: Self::NESTED,
                found: other.kind_name(),
            }),
        }
    }

    /// Full tensor shape for leaves, batch shape for nested containers.
    pub fn shape(&self) -> Shape {
        match self {
            Entry::Tensor(t) => t.shape().clone(),
            Entry::Nested(td) => td.batch_size(),
        }
    }

    pub fn device(&self) -> Option<Device> {
        match self {
            Entry::Tensor(t) => Some(t.device()),
            Entry::Nested(td) => td.device(),
        }
    }

    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            kind: self.kind_name(),
            shape: self.shape(),
            dtype: self.as_tensor().map(Tensor::dtype),
            device: self.device(),
        }
    }

    pub(crate) fn index(&self, idx: &[TensorIndex]) -> Result<Entry> {
        Ok(match self {
            Entry::Tensor(t) => Entry::Tensor(t.index(idx)?),
            Entry::Nested(td) => Entry::Nested(td.index(idx)?),
        })
    }

    pub(crate) fn unsqueeze(&self, dim: usize) -> Result<Entry> {
        Ok(match self {
            Entry::Tensor(t) => Entry::Tensor(t.unsqueeze(dim as isize)?),
            Entry::Nested(td) => Entry::Nested(td.unsqueeze(dim as isize)?),
        })
    }

    pub(crate) fn squeeze(&self, dim: usize) -> Result<Entry> {
        Ok(match self {
            Entry::Tensor(t) => Entry::Tensor(t.squeeze_dim(dim as isize)?),
            Entry::Nested(td) => Entry::Nested(td.squeeze(dim as isize)?),
        })
    }

    /// Permute the leading `order.len()` dims; trailing dims keep their place.
    pub(crate) fn permute_batch(&self, order: &[usize]) -> Result<Entry> {
        let full = |ndim: usize| -> Vec<usize> {
            order.iter().copied().chain(order.len()..ndim).collect()
        };
        Ok(match self {
            Entry::Tensor(t) => Entry::Tensor(t.permute(&full(t.ndim()))?),
            Entry::Nested(td) => Entry::Nested(td.permute(&full(td.batch_dims()))?),
        })
    }

    /// Replace the leading `old_ndim` dims with `batch`.
    pub(crate) fn view_batch(&self, old_ndim: usize, batch: &Shape) -> Result<Entry> {
        let target = |shape: &Shape| -> Vec<isize> {
            batch
                .dims()
                .iter()
                .chain(shape.trailing(old_ndim))
                .map(|&d| d as isize)
                .collect()
        };
        Ok(match self {
            Entry::Tensor(t) => Entry::Tensor(t.reshape(&target(t.shape()))?),
            Entry::Nested(td) => Entry::Nested(td.view(&target(&td.batch_size()))?),
        })
    }

    pub(crate) fn to(&self, device: Device) -> Result<Entry> {
        Ok(match self {
            Entry::Tensor(t) => Entry::Tensor(t.to(device)?),
            Entry::Nested(td) => Entry::Nested(td.to(device)?.into()),
        })
    }

    pub(crate) fn deep_clone(&self) -> Result<Entry> {
        Ok(match self {
            Entry::Tensor(t) => Entry::Tensor(t.deep_clone()),
            Entry::Nested(td) => Entry::Nested(td.materialize()?.into()),
        })
    }

    /// Move every leaf into `mode`. Private is a no-op.
    pub(crate) fn apply_mode(&self, mode: StorageMode) -> Result<()> {
        match (self, mode) {
            (_, StorageMode::Private) => Ok(()),
            (Entry::Tensor(t), StorageMode::Shared) => Ok(t.share_memory_()?),
            (Entry::Tensor(t), StorageMode::MemoryMapped) => Ok(t.memmap_()?),
            (Entry::Nested(td), StorageMode::Shared) => td.share_memory_(),
            (Entry::Nested(td), StorageMode::MemoryMapped) => td.memmap_(),
        }
    }

    /// Structural and value equality.
    pub fn equal(&self, other: &Entry) -> Result<bool> {
        match (self, other) {
            (Entry::Tensor(a), Entry::Tensor(b)) => Ok(a.equal(b)),
            (Entry::Nested(a), Entry::Nested(b)) => a.equal(b),
            _ => Ok(false),
        }
    }
}

/// Kind, shape, dtype and device of an entry, known without reading it.
///
/// `shape` follows [`Entry::shape`]; `dtype` is `None` for nested containers.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryMeta {
    pub kind: &'static str,
    pub shape: Shape,
    pub dtype: Option<DType>,
    pub device: Option<Device>,
}

impl EntryMeta {
    pub fn is_tensor(&self) -> bool {
        self.kind == Entry::TENSOR
    }

    pub fn is_nested(&self) -> bool {
        self.kind == Entry::NESTED
    }

    pub(crate) fn with_shape(self, shape: Shape) -> Self {
        Self { shape, ..self }
    }

    /// Replace the leading `old_ndim` dims with `batch`.
    pub(crate) fn view_batch(self, old_ndim: usize, batch: &Shape) -> Self {
        let shape = batch.concat(self.shape.trailing(old_ndim));
        self.with_shape(shape)
    }

    /// Permute the leading `order.len()` dims.
    pub(crate) fn permute_batch(self, order: &[usize]) -> Self {
        let full: Vec<usize> = order.iter().copied().chain(order.len()..self.shape.ndim()).collect();
        let shape = self.shape.permuted(&full);
        self.with_shape(shape)
    }
}

impl From<Tensor> for Entry {
    fn from(t: Tensor) -> Self {
        Entry::Tensor(t)
    }
}

impl From<&Tensor> for Entry {
    fn from(t: &Tensor) -> Self {
        Entry::Tensor(t.clone())
    }
}

macro_rules! impl_entry_from_container {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Entry {
                fn from(td: $t) -> Self {
                    Entry::Nested(td.into())
                }
            }

            impl From<&$t> for Entry {
                fn from(td: &$t) -> Self {
                    Entry::Nested(td.clone().into())
                }
            }
        )*
    };
}

impl_entry_from_container!(
    AnyTensorDict,
    TensorDict,
    SubTensorDict,
    UnsqueezedTensorDict,
    ViewedTensorDict,
    PermutedTensorDict,
    LazyStackedTensorDict
);
