use std::fmt;
use std::sync::Arc;

use kore_core::{Device, Shape, Tensor, TensorIndex};
use tracing::trace;

use crate::any::AnyTensorDict;
use crate::base::TensorDictBase;
use crate::entry::{Entry, EntryMeta};
use crate::error::{Result, TensorDictError};
use crate::tensordict::{fmt_container, TensorDict};
use crate::utils;

struct Inner {
    parent: AnyTensorDict,
    index: Vec<TensorIndex>,
    batch_size: Shape,
}

/// Non-owning view of `parent` at a fixed index expression.
///
/// Nothing is cached: every read is `parent.get(key)[index]` and every
/// write lands in the parent at `index`, so mutations are visible in both
/// directions. If the parent's batch size changes so that `index` no
/// longer yields the recorded batch size, access fails with
/// `StaleReference`.
#[derive(Clone)]
pub struct SubTensorDict {
    inner: Arc<Inner>,
}

impl SubTensorDict {
    pub fn new(parent: AnyTensorDict, index: Vec<TensorIndex>) -> Result<Self> {
        let batch_size = utils::checked_index_shape(&parent.batch_size(), &index)?;
        Ok(Self {
            inner: Arc::new(Inner {
                parent,
                index,
                batch_size,
            }),
        })
    }

    pub fn parent(&self) -> &AnyTensorDict {
        &self.inner.parent
    }

    pub fn index_expr(&self) -> &[TensorIndex] {
        &self.inner.index
    }

    pub fn same_as(&self, other: &SubTensorDict) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_fresh(&self) -> Result<()> {
        let parent = self.inner.parent.batch_size();
        match utils::checked_index_shape(&parent, &self.inner.index) {
            Ok(shape) if shape == self.inner.batch_size => Ok(()),
            _ => Err(TensorDictError::StaleReference(format!(
                "sub-view of batch size {} no longer matches parent batch size {parent}",
                self.inner.batch_size
            ))),
        }
    }

    /// Allocate a zero-filled entry in the parent able to receive `value`.
    fn allocate_in_parent(&self, key: &str, value: &Entry) -> Result<()> {
        let parent = &self.inner.parent;
        let parent_batch = parent.batch_size();
        let trailing = Shape::new(value.shape().trailing(self.inner.batch_size.ndim()));
        let full = parent_batch.concat(trailing.dims());
        let device = parent.device().or(value.device()).unwrap_or_default();
        let fresh = match value {
            Entry::Tensor(t) => Entry::Tensor(Tensor::zeros_on(full.dims(), t.dtype(), device)),
            Entry::Nested(_) => Entry::Nested(TensorDict::empty(full, Some(device)).into()),
        };
        trace!(key, shape = %fresh.shape(), "allocating entry in parent");
        parent.set_entry(key, fresh)
    }
}

impl TensorDictBase for SubTensorDict {
    fn batch_size(&self) -> Shape {
        self.inner.batch_size.clone()
    }

    fn device(&self) -> Option<Device> {
        self.inner.parent.device()
    }

    fn key_list(&self) -> Vec<String> {
        self.inner.parent.key_list()
    }

    fn get(&self, key: &str) -> Result<Entry> {
        self.check_fresh()?;
        self.inner.parent.get(key)?.index(&self.inner.index)
    }

    fn entry_meta(&self, key: &str) -> Result<EntryMeta> {
        self.check_fresh()?;
        let parent = &self.inner.parent;
        let old_ndim = parent.batch_dims();
        Ok(parent.entry_meta(key)?.view_batch(old_ndim, &self.inner.batch_size))
    }

    /// Writes into the parent at the stored index. Keys missing from the
    /// parent are first allocated there, zero-filled.
    fn set_entry(&self, key: &str, value: Entry) -> Result<()> {
        self.check_fresh()?;
        utils::check_entry(key, &value, &self.inner.batch_size, self.device())?;

        let parent = &self.inner.parent;
        if !parent.contains(key) {
            self.allocate_in_parent(key, &value)?;
        }
        match (parent.get(key)?, value) {
            (Entry::Tensor(_), Entry::Tensor(src)) => parent.set_at(key, &self.inner.index, &src),
            (Entry::Nested(dst), Entry::Nested(src)) => {
                let view = dst.get_sub_tensordict(&self.inner.index)?;
                for k in src.key_list() {
                    view.set_entry(&k, src.get(&k)?)?;
                }
                Ok(())
            }
            (dst, src) => Err(TensorDictError::KindMismatch {
                key: key.to_string(),
                expected: dst.kind_name(),
                found: src.kind_name(),
            }),
        }
    }

    fn set_at(&self, key: &str, idx: &[TensorIndex], value: &Tensor) -> Result<()> {
        if self.inner.parent.reads_alias() {
            return utils::default_set_at(self, key, idx, value);
        }
        utils::write_back(self, key, idx, value, |full| {
            self.inner.parent.set_at(key, &self.inner.index, full)
        })
    }

    fn del(&self, key: &str) -> Result<()> {
        self.inner.parent.del(key)
    }

    fn set_batch_size(&self, batch_size: &[usize]) -> Result<()> {
        Err(TensorDictError::ShapeMismatch(format!(
            "cannot set batch size {batch_size:?} on a sub-view; materialize it first"
        )))
    }

    fn to_any(&self) -> AnyTensorDict {
        AnyTensorDict::Sub(self.clone())
    }
}

impl fmt::Debug for SubTensorDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_container(f, "SubTensorDict", self)
    }
}
