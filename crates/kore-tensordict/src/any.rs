use std::fmt;

use kore_core::{Device, Shape, Tensor, TensorIndex};

use crate::base::TensorDictBase;
use crate::entry::{Entry, EntryMeta};
use crate::error::Result;
use crate::lazy::{LazyStackedTensorDict, PermutedTensorDict, UnsqueezedTensorDict, ViewedTensorDict};
use crate::sub::SubTensorDict;
use crate::tensordict::TensorDict;

/// Which container variant an [`AnyTensorDict`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorDictKind {
    Eager,
    Sub,
    Unsqueezed,
    Viewed,
    Permuted,
    LazyStacked,
}

impl TensorDictKind {
    /// Whether the variant computes its entries from another container.
    pub fn is_lazy(&self) -> bool {
        !matches!(self, TensorDictKind::Eager)
    }
}

/// Handle to any container variant.
///
/// Nested entries and the results of structural operations are held as
/// `AnyTensorDict`, so code can accept any variant without generics. All
/// variants are cheap reference-counted handles; cloning never copies data.
#[derive(Clone)]
pub enum AnyTensorDict {
    Eager(TensorDict),
    Sub(SubTensorDict),
    Unsqueezed(UnsqueezedTensorDict),
    Viewed(ViewedTensorDict),
    Permuted(PermutedTensorDict),
    LazyStacked(LazyStackedTensorDict),
}

macro_rules! dispatch {
    ($self:expr, $td:ident => $body:expr) => {
        match $self {
            AnyTensorDict::Eager($td) => $body,
            AnyTensorDict::Sub($td) => $body,
            AnyTensorDict::Unsqueezed($td) => $body,
            AnyTensorDict::Viewed($td) => $body,
            AnyTensorDict::Permuted($td) => $body,
            AnyTensorDict::LazyStacked($td) => $body,
        }
    };
}

impl AnyTensorDict {
    pub fn kind(&self) -> TensorDictKind {
        match self {
            AnyTensorDict::Eager(_) => TensorDictKind::Eager,
            AnyTensorDict::Sub(_) => TensorDictKind::Sub,
            AnyTensorDict::Unsqueezed(_) => TensorDictKind::Unsqueezed,
            AnyTensorDict::Viewed(_) => TensorDictKind::Viewed,
            AnyTensorDict::Permuted(_) => TensorDictKind::Permuted,
            AnyTensorDict::LazyStacked(_) => TensorDictKind::LazyStacked,
        }
    }

    pub fn is_lazy(&self) -> bool {
        self.kind().is_lazy()
    }

    pub fn as_eager(&self) -> Option<&TensorDict> {
        match self {
            AnyTensorDict::Eager(td) => Some(td),
            _ => None,
        }
    }

    pub fn as_lazy_stacked(&self) -> Option<&LazyStackedTensorDict> {
        match self {
            AnyTensorDict::LazyStacked(td) => Some(td),
            _ => None,
        }
    }

    /// Whether leaves read through this handle alias stored tensors, so
    /// that writing into them reaches storage.
    pub(crate) fn reads_alias(&self) -> bool {
        match self {
            AnyTensorDict::Eager(_) => true,
            AnyTensorDict::LazyStacked(_) => false,
            AnyTensorDict::Sub(td) => td.parent().reads_alias(),
            AnyTensorDict::Unsqueezed(td) => td.source().reads_alias(),
            AnyTensorDict::Viewed(td) => td.source().reads_alias(),
            AnyTensorDict::Permuted(td) => td.source().reads_alias(),
        }
    }

    /// Whether both handles refer to the same container object.
    pub fn same_as(&self, other: &AnyTensorDict) -> bool {
        match (self, other) {
            (AnyTensorDict::Eager(a), AnyTensorDict::Eager(b)) => a.same_as(b),
            (AnyTensorDict::Sub(a), AnyTensorDict::Sub(b)) => a.same_as(b),
            (AnyTensorDict::Unsqueezed(a), AnyTensorDict::Unsqueezed(b)) => a.same_as(b),
            (AnyTensorDict::Viewed(a), AnyTensorDict::Viewed(b)) => a.same_as(b),
            (AnyTensorDict::Permuted(a), AnyTensorDict::Permuted(b)) => a.same_as(b),
            (AnyTensorDict::LazyStacked(a), AnyTensorDict::LazyStacked(b)) => a.same_as(b),
            _ => false,
        }
    }
}

impl TensorDictBase for AnyTensorDict {
    fn batch_size(&self) -> Shape {
        dispatch!(self, td => td.batch_size())
    }

    fn device(&self) -> Option<Device> {
        dispatch!(self, td => td.device())
    }

    fn key_list(&self) -> Vec<String> {
        dispatch!(self, td => td.key_list())
    }

    fn get(&self, key: &str) -> Result<Entry> {
        dispatch!(self, td => td.get(key))
    }

    fn entry_meta(&self, key: &str) -> Result<EntryMeta> {
        dispatch!(self, td => td.entry_meta(key))
    }

    fn set_entry(&self, key: &str, value: Entry) -> Result<()> {
        dispatch!(self, td => td.set_entry(key, value))
    }

    fn del(&self, key: &str) -> Result<()> {
        dispatch!(self, td => td.del(key))
    }

    fn set_batch_size(&self, batch_size: &[usize]) -> Result<()> {
        dispatch!(self, td => td.set_batch_size(batch_size))
    }

    fn to_any(&self) -> AnyTensorDict {
        self.clone()
    }

    fn set_at(&self, key: &str, idx: &[TensorIndex], value: &Tensor) -> Result<()> {
        dispatch!(self, td => td.set_at(key, idx, value))
    }

    fn index(&self, idx: &[TensorIndex]) -> Result<AnyTensorDict> {
        dispatch!(self, td => td.index(idx))
    }

    fn unsqueeze(&self, dim: isize) -> Result<AnyTensorDict> {
        dispatch!(self, td => td.unsqueeze(dim))
    }

    fn squeeze(&self, dim: isize) -> Result<AnyTensorDict> {
        dispatch!(self, td => td.squeeze(dim))
    }

    fn view(&self, batch_size: &[isize]) -> Result<AnyTensorDict> {
        dispatch!(self, td => td.view(batch_size))
    }

    fn permute(&self, order: &[usize]) -> Result<AnyTensorDict> {
        dispatch!(self, td => td.permute(order))
    }

    fn materialize(&self) -> Result<TensorDict> {
        dispatch!(self, td => td.materialize())
    }

    fn contiguous(&self) -> Result<TensorDict> {
        dispatch!(self, td => td.contiguous())
    }

    fn is_shared(&self) -> bool {
        dispatch!(self, td => td.is_shared())
    }

    fn is_memmapped(&self) -> bool {
        dispatch!(self, td => td.is_memmapped())
    }

    fn share_memory_(&self) -> Result<()> {
        dispatch!(self, td => td.share_memory_())
    }

    fn memmap_(&self) -> Result<()> {
        dispatch!(self, td => td.memmap_())
    }
}

impl fmt::Debug for AnyTensorDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, td => fmt::Debug::fmt(td, f))
    }
}

macro_rules! impl_any_from {
    ($($variant:ident($t:ty)),*) => {
        $(
            impl From<$t> for AnyTensorDict {
                fn from(td: $t) -> Self {
                    AnyTensorDict::$variant(td)
                }
            }
        )*
    };
}

impl_any_from!(
    Eager(TensorDict),
    Sub(SubTensorDict),
    Unsqueezed(UnsqueezedTensorDict),
    Viewed(ViewedTensorDict),
    Permuted(PermutedTensorDict),
    LazyStacked(LazyStackedTensorDict)
);
