use std::fmt;
use std::sync::Arc;

use kore_core::{Device, Shape, Tensor, TensorIndex};

use super::{check_source, read_only_batch};
use crate::any::AnyTensorDict;
use crate::base::TensorDictBase;
use crate::entry::{Entry, EntryMeta};
use crate::error::{Result, TensorDictError};
use crate::tensordict::fmt_container;
use crate::utils;

struct Inner {
    source: AnyTensorDict,
    source_batch: Shape,
    batch_size: Shape,
}

/// `source` with its batch dimensions reshaped to `batch_size`.
///
/// Leaves are reshaped on read (`[source batch] + trailing` becomes
/// `[batch_size] + trailing`) as aliasing tensor views, so writes through
/// them reach the source.
#[derive(Clone)]
pub struct ViewedTensorDict {
    inner: Arc<Inner>,
}

impl ViewedTensorDict {
    pub fn new(source: AnyTensorDict, batch_size: Shape) -> Result<Self> {
        let source_batch = source.batch_size();
        if source_batch.numel() != batch_size.numel() {
            return Err(TensorDictError::ShapeMismatch(format!(
                "cannot view batch size {source_batch} as {batch_size}"
            )));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                source,
                source_batch,
                batch_size,
            }),
        })
    }

    pub fn source(&self) -> &AnyTensorDict {
        &self.inner.source
    }

    pub fn same_as(&self, other: &ViewedTensorDict) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_fresh(&self) -> Result<()> {
        check_source("viewed container", &self.inner.source, &self.inner.source_batch)
    }
}

impl TensorDictBase for ViewedTensorDict {
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
        self.inner
            .source
            .get(key)?
            .view_batch(self.inner.source_batch.ndim(), &self.inner.batch_size)
    }

    fn entry_meta(&self, key: &str) -> Result<EntryMeta> {
        self.check_fresh()?;
        Ok(self
            .inner
            .source
            .entry_meta(key)?
            .view_batch(self.inner.source_batch.ndim(), &self.inner.batch_size))
    }

    fn set_entry(&self, key: &str, value: Entry) -> Result<()> {
        self.check_fresh()?;
        utils::check_entry(key, &value, &self.inner.batch_size, self.device())?;
        let value = value.view_batch(self.inner.batch_size.ndim(), &self.inner.source_batch)?;
        self.inner.source.set_entry(key, value)
    }

    fn set_at(&self, key: &str, idx: &[TensorIndex], value: &Tensor) -> Result<()> {
        if self.inner.source.reads_alias() {
            return utils::default_set_at(self, key, idx, value);
        }
        utils::write_back(self, key, idx, value, |full| {
            let trailing = full.shape().trailing(self.inner.batch_size.ndim());
            let shape: Vec<isize> = self
                .inner
                .source_batch
                .concat(trailing)
                .dims()
                .iter()
                .map(|&d| d as isize)
                .collect();
            self.inner.source.set_at(key, &[], &full.reshape(&shape)?)
        })
    }

    fn del(&self, key: &str) -> Result<()> {
        self.inner.source.del(key)
    }

    fn set_batch_size(&self, batch_size: &[usize]) -> Result<()> {
        Err(read_only_batch("viewed container", batch_size))
    }

    fn to_any(&self) -> AnyTensorDict {
        AnyTensorDict::Viewed(self.clone())
    }

    /// Views compose: the result always wraps the original source, and
    /// viewing back to the source's batch size returns the source.
    fn view(&self, batch_size: &[isize]) -> Result<AnyTensorDict> {
        self.check_fresh()?;
        let batch = &self.inner.batch_size;
        let target = batch.resolve_reshape(batch_size).ok_or_else(|| {
            TensorDictError::ShapeMismatch(format!(
                "cannot view batch size {batch} as {batch_size:?}"
            ))
        })?;
        if &target == batch {
            return Ok(self.to_any());
        }
        if target == self.inner.source_batch {
            return Ok(self.inner.source.clone());
        }
        Ok(ViewedTensorDict::new(self.inner.source.clone(), target)?.into())
    }

    fn squeeze(&self, dim: isize) -> Result<AnyTensorDict> {
        let batch = &self.inner.batch_size;
        let d = utils::batch_axis(batch, dim, 0)?;
        if batch.dims()[d] != 1 {
            return Ok(self.to_any());
        }
        let target: Vec<isize> = batch.removed(d).dims().iter().map(|&s| s as isize).collect();
        self.view(&target)
    }
}

impl fmt::Debug for ViewedTensorDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_container(f, "ViewedTensorDict", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TensorDict;
    use kore_core::Tensor;

    fn td() -> TensorDict {
        TensorDict::new(
            [("a", Tensor::arange(0.0, 24.0, 1.0).reshape(&[3, 4, 2]).unwrap())],
            [3, 4],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_view_reshapes_leaves() {
        let td = td();
        let view = td.view(&[12]).unwrap();
        assert_eq!(view.batch_size().dims(), &[12]);
        let a = view.get_tensor("a").unwrap();
        assert_eq!(a.shape().dims(), &[12, 2]);
        assert_eq!(a.to_vec_f32(), td.get_tensor("a").unwrap().to_vec_f32());
    }

    #[test]
    fn test_view_back_returns_source() {
        let td = td();
        let flat = td.view(&[-1]).unwrap();
        let again = flat.view(&[2, 6]).unwrap();
        assert_eq!(again.kind(), crate::TensorDictKind::Viewed);
        assert!(again.view(&[3, 4]).unwrap().same_as(&td.to_any()));
        assert!(flat.view(&[12]).unwrap().same_as(&flat));
    }

    #[test]
    fn test_numel_mismatch() {
        let td = td();
        assert!(matches!(
            ViewedTensorDict::new(td.to_any(), Shape::new(&[5])),
            Err(TensorDictError::ShapeMismatch(_))
        ));
        assert!(td.view(&[5, -1]).is_err());
    }

    #[test]
    fn test_set_reshapes_back() {
        let td = td();
        let flat = td.view(&[12]).unwrap();
        flat.set("b", Tensor::ones(&[12, 3])).unwrap();
        assert_eq!(td.get_tensor("b").unwrap().shape().dims(), &[3, 4, 3]);

        flat.set_at("a", &[0.into()], &Tensor::from_f32(&[-1.0, -1.0], &[2])).unwrap();
        assert_eq!(td.get_tensor("a").unwrap().to_vec_f32()[..3].to_vec(), vec![-1.0, -1.0, 2.0]);
    }
}
