use std::fmt;
use std::sync::Arc;

use kore_core::{Device, Shape, StorageMode, Tensor, TensorIndex};
use tracing::debug;

use super::read_only_batch;
use crate::any::AnyTensorDict;
use crate::base::TensorDictBase;
use crate::entry::{Entry, EntryMeta};
use crate::error::{Result, TensorDictError};
use crate::tensordict::{fmt_container, TensorDict};
use crate::utils::{self, Located};

struct Inner {
    sources: Vec<AnyTensorDict>,
    dim: usize,
    source_batch: Shape,
    batch_size: Shape,
}

/// Several containers with identical structure, stacked along a new batch
/// dimension `dim` without copying.
///
/// Reading a leaf stacks the sources' leaves into a fresh tensor; reading a
/// nested key gives another lazy stack. Indexing the stack dimension with
/// an integer returns the original source object.
///
/// # Examples
///
/// ```
/// use kore_core::{DType, Tensor};
/// use kore_tensordict::{stack, TensorDict, TensorDictBase};
///
/// let parts: Vec<TensorDict> = (0..3)
///     .map(|_| TensorDict::new([("x", Tensor::zeros(&[4], DType::F32))], [4], None).unwrap())
///     .collect();
/// let stacked = stack(&parts, 0).unwrap();
/// assert_eq!(stacked.batch_size().dims(), &[3, 4]);
/// assert!(stacked.index(&[1.into()]).unwrap().same_as(&parts[1].clone().into()));
/// ```
#[derive(Clone)]
pub struct LazyStackedTensorDict {
    inner: Arc<Inner>,
}

impl LazyStackedTensorDict {
    /// Stack `sources` along batch dimension `dim` (`0..=batch_dims`).
    pub fn new(sources: Vec<AnyTensorDict>, dim: usize) -> Result<Self> {
        let first = sources.first().ok_or_else(|| {
            TensorDictError::ShapeMismatch("cannot stack an empty sequence of containers".into())
        })?;
        let source_batch = first.batch_size();
        if dim > source_batch.ndim() {
            return Err(TensorDictError::IndexOutOfRange(format!(
                "stack dimension {dim} out of range for batch size {source_batch}"
            )));
        }
        check_stackable(&sources, "")?;
        debug!(sources = sources.len(), dim, "lazy stack");
        Ok(Self::from_checked(sources, dim))
    }

    /// Stack sources already known to be stackable along `dim`, such as the
    /// nested containers of a validated stack.
    pub(crate) fn from_checked(sources: Vec<AnyTensorDict>, dim: usize) -> Self {
        let source_batch = sources[0].batch_size();
        let batch_size = source_batch.inserted(dim, sources.len());
        Self {
            inner: Arc::new(Inner {
                sources,
                dim,
                source_batch,
                batch_size,
            }),
        }
    }

    pub fn sources(&self) -> &[AnyTensorDict] {
        &self.inner.sources
    }

    pub fn stack_dim(&self) -> usize {
        self.inner.dim
    }

    pub fn same_as(&self, other: &LazyStackedTensorDict) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_fresh(&self) -> Result<()> {
        for source in &self.inner.sources {
            super::check_source("lazy stack", source, &self.inner.source_batch)?;
        }
        Ok(())
    }

    fn pick(&self, i: usize, rest: &[TensorIndex]) -> Result<AnyTensorDict> {
        let source = &self.inner.sources[i];
        if rest.is_empty() {
            Ok(source.clone())
        } else {
            source.index(rest)
        }
    }

    fn transition(&self, mode: StorageMode) -> Result<()> {
        for source in &self.inner.sources {
            utils::check_transition(source, mode)?;
        }
        for source in &self.inner.sources {
            match mode {
                StorageMode::Shared => source.share_memory_()?,
                StorageMode::MemoryMapped => source.memmap_()?,
                StorageMode::Private => {}
            }
        }
        Ok(())
    }
}

/// Sources must agree on batch size, key set, entry kinds, leaf shapes,
/// dtypes and device, recursively. Only entry metadata is read, so no leaf
/// is built even when a source is itself lazy.
pub(crate) fn check_stackable(sources: &[AnyTensorDict], prefix: &str) -> Result<()> {
    let Some(first) = sources.first() else {
        return Ok(());
    };
    let batch = first.batch_size();
    for other in &sources[1..] {
        if other.batch_size() != batch {
            return Err(TensorDictError::ShapeMismatch(format!(
                "cannot stack containers with batch sizes {batch} and {}",
                other.batch_size()
            )));
        }
    }
    check_same_keys(sources, prefix)?;

    for key in first.key_list() {
        let path = format!("{prefix}{key}");
        let metas = sources
            .iter()
            .map(|s| s.entry_meta(&key))
            .collect::<Result<Vec<_>>>()?;
        let head = &metas[0];
        for meta in &metas[1..] {
            if meta.kind != head.kind {
                return Err(TensorDictError::KindMismatch {
                    key: path,
                    expected: head.kind,
                    found: meta.kind,
                });
            }
            if let (Some(expected), Some(got)) = (head.device, meta.device) {
                if expected != got {
                    return Err(TensorDictError::DeviceMismatch {
                        key: path,
                        expected,
                        got,
                    });
                }
            }
            if let (Some(expected), Some(got)) = (head.dtype, meta.dtype) {
                if expected != got {
                    return Err(TensorDictError::DTypeMismatch {
                        key: path,
                        expected,
                        got,
                    });
                }
            }
            if head.is_tensor() && meta.shape != head.shape {
                return Err(TensorDictError::ShapeMismatch(format!(
                    "cannot stack \"{path}\" with shapes {} and {}",
                    head.shape, meta.shape
                )));
            }
        }
        if head.is_nested() {
            let nested = sources
                .iter()
                .map(|s| s.get_nested(&key))
                .collect::<Result<Vec<_>>>()?;
            check_stackable(&nested, &format!("{path}."))?;
        }
    }
    Ok(())
}

/// Every container must hold exactly the keys of the first one.
pub(crate) fn check_same_keys(sources: &[AnyTensorDict], prefix: &str) -> Result<()> {
    let Some(first) = sources.first() else {
        return Ok(());
    };
    let keys = first.key_list();
    for other in &sources[1..] {
        let other_keys = other.key_list();
        let missing = keys
            .iter()
            .find(|k| !other_keys.contains(k))
            .or_else(|| other_keys.iter().find(|k| !keys.contains(k)));
        if let Some(key) = missing {
            return Err(TensorDictError::KeyMismatch(format!(
                "key \"{prefix}{key}\" is not present in every container"
            )));
        }
    }
    Ok(())
}

impl TensorDictBase for LazyStackedTensorDict {
    fn batch_size(&self) -> Shape {
        self.inner.batch_size.clone()
    }

    fn device(&self) -> Option<Device> {
        self.inner.sources[0].device()
    }

    fn key_list(&self) -> Vec<String> {
        self.inner.sources[0].key_list()
    }

    /// Leaves are stacked into a new tensor; nested keys give a lazy stack
    /// of the nested containers.
    fn get(&self, key: &str) -> Result<Entry> {
        self.check_fresh()?;
        let entries = self
            .inner
            .sources
            .iter()
            .map(|s| s.get(key))
            .collect::<Result<Vec<_>>>()?;
        if entries[0].is_tensor() {
            let leaves = entries
                .into_iter()
                .map(|e| e.into_tensor(key))
                .collect::<Result<Vec<_>>>()?;
            let refs: Vec<&Tensor> = leaves.iter().collect();
            Ok(Entry::Tensor(Tensor::stack(&refs, self.inner.dim as isize)?))
        } else {
            let nested = entries
                .into_iter()
                .map(|e| e.into_nested(key))
                .collect::<Result<Vec<_>>>()?;
            Ok(Entry::Nested(
                LazyStackedTensorDict::from_checked(nested, self.inner.dim).into(),
            ))
        }
    }

    fn entry_meta(&self, key: &str) -> Result<EntryMeta> {
        self.check_fresh()?;
        let meta = self.inner.sources[0].entry_meta(key)?;
        let shape = meta.shape.inserted(self.inner.dim, self.inner.sources.len());
        Ok(meta.with_shape(shape))
    }

    /// The value is split along the stack dimension and each part is set in
    /// the matching source. Every part is validated before any is written.
    fn set_entry(&self, key: &str, value: Entry) -> Result<()> {
        self.check_fresh()?;
        utils::check_entry(key, &value, &self.inner.batch_size, self.device())?;
        let dim = self.inner.dim as isize;
        let parts: Vec<Entry> = match &value {
            Entry::Tensor(t) => t.unbind(dim)?.into_iter().map(Entry::Tensor).collect(),
            Entry::Nested(td) => td.unbind(dim)?.into_iter().map(Entry::Nested).collect(),
        };
        for (source, part) in self.inner.sources.iter().zip(&parts) {
            utils::check_entry(key, part, &source.batch_size(), source.device())?;
        }
        for (source, part) in self.inner.sources.iter().zip(parts) {
            source.set_entry(key, part)?;
        }
        Ok(())
    }

    fn set_at(&self, key: &str, idx: &[TensorIndex], value: &Tensor) -> Result<()> {
        utils::checked_index_shape(&self.inner.batch_size, idx)?;
        self.check_fresh()?;
        if let Located::Item { pos, .. } = utils::locate(idx, self.inner.dim) {
            if let TensorIndex::Select(_) = idx[pos] {
                let i = idx[pos].positions(self.inner.sources.len())?[0];
                return self.inner.sources[i].set_at(key, &utils::without(idx, pos), value);
            }
        }
        utils::write_back(self, key, idx, value, |full| {
            let parts = full.unbind(self.inner.dim as isize)?;
            for (source, part) in self.inner.sources.iter().zip(&parts) {
                source.set_at(key, &[], part)?;
            }
            Ok(())
        })
    }

    fn del(&self, key: &str) -> Result<()> {
        if let Some(source) = self.inner.sources.iter().find(|s| !s.contains(key)) {
            debug!(batch_size = %source.batch_size(), key, "stacked source lacks key");
            return Err(TensorDictError::KeyNotFound(key.to_string()));
        }
        self.inner.sources.iter().try_for_each(|s| s.del(key))
    }

    fn set_batch_size(&self, batch_size: &[usize]) -> Result<()> {
        Err(read_only_batch("lazy stack", batch_size))
    }

    fn to_any(&self) -> AnyTensorDict {
        AnyTensorDict::LazyStacked(self.clone())
    }

    /// Indexing the stack dimension picks sources without copying; other
    /// items are forwarded into every source.
    fn index(&self, idx: &[TensorIndex]) -> Result<AnyTensorDict> {
        utils::checked_index_shape(&self.inner.batch_size, idx)?;
        self.check_fresh()?;
        let idx = utils::trim_full(idx);
        if idx.is_empty() {
            return Ok(self.to_any());
        }
        match utils::locate(idx, self.inner.dim) {
            Located::Item { pos, out } => {
                let item = &idx[pos];
                if item.span() != 1 {
                    return self.materialize()?.index(idx);
                }
                let rest = utils::without(idx, pos);
                let picks = item.positions(self.inner.sources.len())?;
                if item.is_select() {
                    return self.pick(picks[0], &rest);
                }
                if picks.is_empty() {
                    return self.materialize()?.index(idx);
                }
                let parts = picks
                    .iter()
                    .map(|&i| self.pick(i, &rest))
                    .collect::<Result<Vec<_>>>()?;
                Ok(LazyStackedTensorDict::new(parts, out)?.into())
            }
            Located::Implicit { out } => {
                let parts = self
                    .inner
                    .sources
                    .iter()
                    .map(|s| s.index(idx))
                    .collect::<Result<Vec<_>>>()?;
                Ok(LazyStackedTensorDict::new(parts, out)?.into())
            }
        }
    }

    fn materialize(&self) -> Result<TensorDict> {
        self.check_fresh()?;
        let out = TensorDict::empty(self.batch_size(), self.device());
        for key in self.key_list() {
            let value = match self.get(&key)? {
                Entry::Tensor(t) => Entry::Tensor(t),
                Entry::Nested(td) => Entry::Nested(td.materialize()?.into()),
            };
            out.insert_unchecked(&key, value);
        }
        debug!(batch_size = %out.batch_size(), keys = out.len(), "materialized lazy stack");
        Ok(out)
    }

    fn is_shared(&self) -> bool {
        self.inner.sources.iter().all(|s| s.is_shared())
    }

    fn is_memmapped(&self) -> bool {
        self.inner.sources.iter().all(|s| s.is_memmapped())
    }

    fn share_memory_(&self) -> Result<()> {
        self.transition(StorageMode::Shared)
    }

    fn memmap_(&self) -> Result<()> {
        self.transition(StorageMode::MemoryMapped)
    }
}

impl fmt::Debug for LazyStackedTensorDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_container(f, "LazyStackedTensorDict", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kore_core::DType;

    fn part(value: f64) -> AnyTensorDict {
        TensorDict::new(
            [
                ("a", Tensor::full(&[3, 2], value, DType::F32)),
                ("b", Tensor::full(&[3], value, DType::I64)),
            ],
            [3],
            None,
        )
        .unwrap()
        .into()
    }

    fn stacked() -> (Vec<AnyTensorDict>, LazyStackedTensorDict) {
        let parts = vec![part(0.0), part(1.0)];
        let lazy = LazyStackedTensorDict::new(parts.clone(), 1).unwrap();
        (parts, lazy)
    }

    #[test]
    fn test_get_stacks_leaves() {
        let (_, lazy) = stacked();
        assert_eq!(lazy.batch_size().dims(), &[3, 2]);
        let a = lazy.get_tensor("a").unwrap();
        assert_eq!(a.shape().dims(), &[3, 2, 2]);
        assert_eq!(a.sum_all(), 6.0);
    }

    #[test]
    fn test_index_at_stack_dim_returns_source() {
        let (parts, lazy) = stacked();
        let picked = lazy.index(&[(..).into(), 1.into()]).unwrap();
        assert!(picked.same_as(&parts[1]));

        let row = lazy.index(&[0.into(), 1.into()]).unwrap();
        assert_eq!(row.batch_size().dims(), &[] as &[usize]);
    }

    #[test]
    fn test_index_other_dim_stays_lazy() {
        let (_, lazy) = stacked();
        let rows = lazy.index(&[(0..2).into()]).unwrap();
        assert_eq!(rows.kind(), crate::TensorDictKind::LazyStacked);
        assert_eq!(rows.batch_size().dims(), &[2, 2]);
        let sel = lazy.index(&[2.into()]).unwrap();
        assert_eq!(sel.batch_size().dims(), &[2]);
        assert_eq!(sel.get_tensor("b").unwrap().to_vec_i64(), vec![0, 1]);
    }

    #[test]
    fn test_writes_reach_sources() {
        let (parts, lazy) = stacked();
        lazy.fill_("a", 5.0).unwrap();
        assert!(parts.iter().all(|p| p.get_tensor("a").unwrap().sum_all() == 30.0));

        lazy.set_at("b", &[(..).into(), 0.into()], &Tensor::from_i64(&[7], &[])).unwrap();
        assert_eq!(parts[0].get_tensor("b").unwrap().to_vec_i64(), vec![7, 7, 7]);
        assert_eq!(parts[1].get_tensor("b").unwrap().to_vec_i64(), vec![1, 1, 1]);

        lazy.set("c", Tensor::ones(&[3, 2])).unwrap();
        assert_eq!(parts[1].get_tensor("c").unwrap().shape().dims(), &[3]);
    }

    #[test]
    fn test_mismatched_sources() {
        let odd: AnyTensorDict =
            TensorDict::new([("a", Tensor::zeros(&[3, 2], DType::F32))], [3], None)
                .unwrap()
                .into();
        assert!(matches!(
            LazyStackedTensorDict::new(vec![part(0.0), odd], 0),
            Err(TensorDictError::KeyMismatch(_))
        ));
        assert!(matches!(
            LazyStackedTensorDict::new(Vec::new(), 0),
            Err(TensorDictError::ShapeMismatch(_))
        ));
    }
}
