use std::fmt;
use std::sync::Arc;

use kore_core::{Device, Shape, Tensor, TensorIndex};

use super::{check_source, read_only_batch};
use crate::any::AnyTensorDict;
use crate::base::TensorDictBase;
use crate::entry::{Entry, EntryMeta};
use crate::error::Result;
use crate::tensordict::fmt_container;
use crate::utils::{self, Located};

struct Inner {
    source: AnyTensorDict,
    dim: usize,
    source_batch: Shape,
    batch_size: Shape,
}

/// `source` with a size-1 batch dimension inserted at `dim`.
#[derive(Clone)]
pub struct UnsqueezedTensorDict {
    inner: Arc<Inner>,
}

impl UnsqueezedTensorDict {
    pub fn new(source: AnyTensorDict, dim: usize) -> Result<Self> {
        let source_batch = source.batch_size();
        let dim = utils::batch_axis(&source_batch, dim as isize, 1)?;
        let batch_size = source_batch.inserted(dim, 1);
        Ok(Self {
            inner: Arc::new(Inner {
                source,
                dim,
                source_batch,
                batch_size,
            }),
        })
    }

    pub fn source(&self) -> &AnyTensorDict {
        &self.inner.source
    }

    pub fn dim(&self) -> usize {
        self.inner.dim
    }

    pub fn same_as(&self, other: &UnsqueezedTensorDict) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_fresh(&self) -> Result<()> {
        check_source("unsqueezed view", &self.inner.source, &self.inner.source_batch)
    }
}

impl TensorDictBase for UnsqueezedTensorDict {
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
        self.inner.source.get(key)?.unsqueeze(self.inner.dim)
    }

    fn entry_meta(&self, key: &str) -> Result<EntryMeta> {
        self.check_fresh()?;
        let meta = self.inner.source.entry_meta(key)?;
        let shape = meta.shape.inserted(self.inner.dim, 1);
        Ok(meta.with_shape(shape))
    }

    fn set_entry(&self, key: &str, value: Entry) -> Result<()> {
        self.check_fresh()?;
        utils::check_entry(key, &value, &self.inner.batch_size, self.device())?;
        self.inner.source.set_entry(key, value.squeeze(self.inner.dim)?)
    }

    fn set_at(&self, key: &str, idx: &[TensorIndex], value: &Tensor) -> Result<()> {
        if self.inner.source.reads_alias() {
            return utils::default_set_at(self, key, idx, value);
        }
        utils::write_back(self, key, idx, value, |full| {
            let part = full.squeeze_dim(self.inner.dim as isize)?;
            self.inner.source.set_at(key, &[], &part)
        })
    }

    fn del(&self, key: &str) -> Result<()> {
        self.inner.source.del(key)
    }

    fn set_batch_size(&self, batch_size: &[usize]) -> Result<()> {
        Err(read_only_batch("unsqueezed view", batch_size))
    }

    fn to_any(&self) -> AnyTensorDict {
        AnyTensorDict::Unsqueezed(self.clone())
    }

    /// Squeezing the inserted dimension gives back the source itself.
    fn squeeze(&self, dim: isize) -> Result<AnyTensorDict> {
        let d = utils::batch_axis(&self.inner.batch_size, dim, 0)?;
        if d == self.inner.dim {
            self.check_fresh()?;
            return Ok(self.inner.source.clone());
        }
        utils::default_squeeze(self, dim)
    }

    /// The index item addressing the inserted dimension is dropped and the
    /// rest is forwarded to the source.
    fn index(&self, idx: &[TensorIndex]) -> Result<AnyTensorDict> {
        utils::checked_index_shape(&self.inner.batch_size, idx)?;
        self.check_fresh()?;
        let idx = utils::trim_full(idx);
        if idx.is_empty() {
            return Ok(self.to_any());
        }
        let source = &self.inner.source;
        match utils::locate(idx, self.inner.dim) {
            Located::Item { pos, out } => {
                let item = &idx[pos];
                let rest = utils::without(idx, pos);
                if item.is_select() {
                    return if rest.is_empty() {
                        Ok(source.clone())
                    } else {
                        source.index(&rest)
                    };
                }
                if item.span() == 1 && !item.is_advanced() && item.positions(1)? == [0] {
                    return source.index(&rest)?.unsqueeze(out as isize);
                }
                utils::default_index(self, idx)
            }
            Located::Implicit { out } => source.index(idx)?.unsqueeze(out as isize),
        }
    }
}

impl fmt::Debug for UnsqueezedTensorDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_container(f, "UnsqueezedTensorDict", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TensorDict;
    use kore_core::{DType, Tensor};

    fn td() -> TensorDict {
        TensorDict::new([("a", Tensor::zeros(&[3, 4, 2], DType::F32))], [3, 4], None).unwrap()
    }

    #[test]
    fn test_squeeze_returns_source() {
        let td = td();
        let view = td.unsqueeze(1).unwrap();
        assert_eq!(view.batch_size().dims(), &[3, 1, 4]);
        let back = view.squeeze(1).unwrap();
        assert!(back.same_as(&td.to_any()));
    }

    #[test]
    fn test_write_through() {
        let td = td();
        let view = td.unsqueeze(0).unwrap();
        view.set("b", Tensor::ones(&[1, 3, 4])).unwrap();
        assert_eq!(td.get_tensor("b").unwrap().shape().dims(), &[3, 4]);
        view.fill_("a", 2.0).unwrap();
        assert_eq!(td.get_tensor("a").unwrap().sum_all(), 48.0);
    }

    #[test]
    fn test_index_selecting_inserted_dim() {
        let td = td();
        let view = td.unsqueeze(0).unwrap();
        assert!(view.index(&[0.into()]).unwrap().same_as(&td.to_any()));

        let row = view.index(&[0.into(), 2.into()]).unwrap();
        assert_eq!(row.batch_size().dims(), &[4]);

        let kept = view.index(&[(..).into(), (1..3).into()]).unwrap();
        assert_eq!(kept.batch_size().dims(), &[1, 2, 4]);
        assert_eq!(kept.kind(), crate::TensorDictKind::Unsqueezed);
    }

    #[test]
    fn test_stale_after_source_reshape() {
        let td = td();
        let view = td.unsqueeze(0).unwrap();
        td.set_batch_size(&[3]).unwrap();
        assert!(matches!(
            view.get("a"),
            Err(crate::TensorDictError::StaleReference(_))
        ));
    }
}
