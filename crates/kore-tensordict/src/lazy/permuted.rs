use std::fmt;
use std::sync::Arc;

use kore_core::{Device, Shape, Tensor, TensorIndex};

use super::{check_source, read_only_batch};
use crate::any::AnyTensorDict;
use crate::base::TensorDictBase;
use crate::entry::{Entry, EntryMeta};
use crate::error::Result;
use crate::tensordict::fmt_container;
use crate::utils;

struct Inner {
    source: AnyTensorDict,
    order: Vec<usize>,
    inverse: Vec<usize>,
    source_batch: Shape,
    batch_size: Shape,
}

/// `source` with its batch dimensions reordered: batch dim `i` of the view
/// is batch dim `order[i]` of the source.
#[derive(Clone)]
pub struct PermutedTensorDict {
    inner: Arc<Inner>,
}

impl PermutedTensorDict {
    pub fn new(source: AnyTensorDict, order: Vec<usize>) -> Result<Self> {
        let source_batch = source.batch_size();
        utils::check_permutation(&order, source_batch.ndim())?;
        let mut inverse = vec![0; order.len()];
        for (i, &o) in order.iter().enumerate() {
            inverse[o] = i;
        }
        let batch_size = source_batch.permuted(&order);
        Ok(Self {
            inner: Arc::new(Inner {
                source,
                order,
                inverse,
                source_batch,
                batch_size,
            }),
        })
    }

    pub fn source(&self) -> &AnyTensorDict {
        &self.inner.source
    }

    pub fn order(&self) -> &[usize] {
        &self.inner.order
    }

    pub fn same_as(&self, other: &PermutedTensorDict) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_fresh(&self) -> Result<()> {
        check_source("permuted view", &self.inner.source, &self.inner.source_batch)
    }

    /// Index built only from selections and slices, routed to the source.
    fn index_basic(&self, idx: &[TensorIndex]) -> Result<AnyTensorDict> {
        let order = &self.inner.order;
        let mut src_idx = vec![TensorIndex::Full; order.len()];
        for (i, item) in idx.iter().enumerate() {
            src_idx[order[i]] = item.clone();
        }
        let kept: Vec<usize> = (0..order.len())
            .filter(|&i| !idx.get(i).is_some_and(TensorIndex::is_select))
            .map(|i| order[i])
            .collect();
        let mut sorted = kept.clone();
        sorted.sort_unstable();
        let ranks: Vec<usize> = kept
            .iter()
            .filter_map(|s| sorted.iter().position(|x| x == s))
            .collect();

        let indexed = self.inner.source.index(&src_idx)?;
        indexed.permute(&ranks)
    }
}

impl TensorDictBase for PermutedTensorDict {
    fn batch_size(&self) -> Shape {
        self.inner.batch_size.clone()
    }

    fn device(&self) -> Option<Device> {
        self.inner.source.device()
    }

    fn key_list(&self) -> Vec<String> {
        self.inner.source.key_list()
    }

    fn get(&self, key: &str) -> Result<Entry> {
        self.check_fresh()?;
        self.inner.source.get(key)?.permute_batch(&self.inner.order)
    }

    fn entry_meta(&self, key: &str) -> Result<EntryMeta> {
        self.check_fresh()?;
        Ok(self.inner.source.entry_meta(key)?.permute_batch(&self.inner.order))
    }

    fn set_entry(&self, key: &str, value: Entry) -> Result<()> {
        self.check_fresh()?;
        utils::check_entry(key, &value, &self.inner.batch_size, self.device())?;
        self.inner
            .source
            .set_entry(key, value.permute_batch(&self.inner.inverse)?)
    }

    fn set_at(&self, key: &str, idx: &[TensorIndex], value: &Tensor) -> Result<()> {
        if self.inner.source.reads_alias() {
            return utils::default_set_at(self, key, idx, value);
        }
        utils::write_back(self, key, idx, value, |full| {
            let inverse = &self.inner.inverse;
            let order: Vec<usize> = inverse.iter().copied().chain(inverse.len()..full.ndim()).collect();
            self.inner.source.set_at(key, &[], &full.permute(&order)?)
        })
    }

    fn del(&self, key: &str) -> Result<()> {
        self.inner.source.del(key)
    }

    fn set_batch_size(&self, batch_size: &[usize]) -> Result<()> {
        Err(read_only_batch("permuted view", batch_size))
    }

    fn to_any(&self) -> AnyTensorDict {
        AnyTensorDict::Permuted(self.clone())
    }

    /// Permutations compose onto the source; cancelling ones return it.
    fn permute(&self, order: &[usize]) -> Result<AnyTensorDict> {
        utils::check_permutation(order, self.inner.order.len())?;
        self.check_fresh()?;
        let composed: Vec<usize> = order.iter().map(|&o| self.inner.order[o]).collect();
        if utils::is_identity(&composed) {
            return Ok(self.inner.source.clone());
        }
        if composed == self.inner.order {
            return Ok(self.to_any());
        }
        Ok(PermutedTensorDict::new(self.inner.source.clone(), composed)?.into())
    }

    fn index(&self, idx: &[TensorIndex]) -> Result<AnyTensorDict> {
        utils::checked_index_shape(&self.inner.batch_size, idx)?;
        self.check_fresh()?;
        let idx = utils::trim_full(idx);
        if idx.is_empty() {
            return Ok(self.to_any());
        }
        let basic = idx.len() <= self.inner.order.len()
            && idx.iter().all(|item| {
                matches!(
                    item,
                    TensorIndex::Select(_) | TensorIndex::Slice { .. } | TensorIndex::Full
                )
            });
        if basic {
            self.index_basic(idx)
        } else {
            utils::default_index(self, idx)
        }
    }
}

impl fmt::Debug for PermutedTensorDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_container(f, "PermutedTensorDict", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TensorDict, TensorDictKind};
    use kore_core::Tensor;

    fn td() -> TensorDict {
        TensorDict::new(
            [("a", Tensor::arange(0.0, 24.0, 1.0).reshape(&[2, 3, 4]).unwrap())],
            [2, 3, 4],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_permute_leaves() {
        let td = td();
        let p = td.permute(&[2, 0, 1]).unwrap();
        assert_eq!(p.batch_size().dims(), &[4, 2, 3]);
        let a = p.get_tensor("a").unwrap();
        assert_eq!(a.shape().dims(), &[4, 2, 3]);
        // a[1, 0, 2] == source[0, 2, 1]
        let v = a.index(&[1.into(), 0.into(), 2.into()]).unwrap().item().unwrap();
        assert_eq!(v, 9.0);
    }

    #[test]
    fn test_compose_and_cancel() {
        let td = td();
        let p = td.permute(&[1, 0, 2]).unwrap();
        assert!(p.permute(&[1, 0, 2]).unwrap().same_as(&td.to_any()));
        let q = p.permute(&[2, 1, 0]).unwrap();
        assert_eq!(q.kind(), TensorDictKind::Permuted);
        assert_eq!(q.batch_size().dims(), &[4, 2, 3]);
        assert!(td.permute(&[0, 1, 2]).unwrap().same_as(&td.to_any()));
    }

    #[test]
    fn test_index_maps_onto_source() {
        let td = td();
        let p = td.permute(&[2, 0, 1]).unwrap();
        let sub = p.index(&[(1..3).into(), 1.into()]).unwrap();
        assert_eq!(sub.batch_size().dims(), &[2, 3]);
        let expected = p.materialize().unwrap().index(&[(1..3).into(), 1.into()]).unwrap();
        assert!(sub.equal(&expected).unwrap());
    }

    #[test]
    fn test_set_applies_inverse() {
        let td = td();
        let p = td.permute(&[2, 0, 1]).unwrap();
        p.set("b", Tensor::zeros(&[4, 2, 3], kore_core::DType::I64)).unwrap();
        assert_eq!(td.get_tensor("b").unwrap().shape().dims(), &[2, 3, 4]);
        p.fill_("a", 1.0).unwrap();
        assert_eq!(td.get_tensor("a").unwrap().sum_all(), 24.0);
    }
}
