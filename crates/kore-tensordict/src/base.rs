//! The access contract shared by every container variant.
//!
//! Implementors supply a handful of primitives (batch size, device, key
//! listing, get/set/delete); everything else is provided in terms of those
//! and is therefore identical across eager containers, sub-views and lazy
//! views. Lazy variants override the structural operations where they can
//! answer without materializing.

use kore_core::{Device, Shape, Tensor, TensorIndex};
use tracing::debug;

use crate::any::AnyTensorDict;
use crate::entry::{Entry, EntryMeta};
use crate::error::{Result, TensorDictError};
use crate::keys::KeysView;
use crate::sub::SubTensorDict;
use crate::tensordict::TensorDict;
use crate::utils;

/// Separator used for dotted nested keys.
pub const NESTED_KEY_SEP: &str = ".";

pub trait TensorDictBase {
    /// Shared leading shape of every entry.
    fn batch_size(&self) -> Shape;

    /// Uniform device of the leaves, if any has been placed.
    fn device(&self) -> Option<Device>;

    /// Top-level keys in insertion order.
    fn key_list(&self) -> Vec<String>;

    /// Entry stored under `key`; `KeyNotFound` if absent.
    fn get(&self, key: &str) -> Result<Entry>;

    /// Insert or replace `key`, validating batch prefix and device.
    fn set_entry(&self, key: &str, value: Entry) -> Result<()>;

    /// Remove `key`; `KeyNotFound` if absent.
    fn del(&self, key: &str) -> Result<()>;

    /// Change the batch shape, re-validating every entry. Atomic.
    fn set_batch_size(&self, batch_size: &[usize]) -> Result<()>;

    /// Cheap, identity-preserving handle to this container.
    fn to_any(&self) -> AnyTensorDict;

    // =========================================================================
    // Access
    // =========================================================================

    fn batch_dims(&self) -> usize {
        self.batch_size().ndim()
    }

    fn set(&self, key: &str, value: impl Into<Entry>) -> Result<()>
    where
        Self: Sized,
    {
        self.set_entry(key, value.into())
    }

    /// Restartable view over the keys.
    fn keys(&self) -> KeysView {
        KeysView::new(self.to_any())
    }

    /// Restartable view over every key, nested ones as dotted paths.
    fn keys_nested(&self) -> KeysView {
        self.keys().include_nested()
    }

    fn contains(&self, key: &str) -> bool {
        self.key_list().iter().any(|k| k == key)
    }

    fn len(&self) -> usize {
        self.key_list().len()
    }

    fn is_empty(&self) -> bool {
        self.key_list().is_empty()
    }

    /// Metadata of the entry under `key`. Lazy variants answer without
    /// building the leaf.
    fn entry_meta(&self, key: &str) -> Result<EntryMeta> {
        Ok(self.get(key)?.meta())
    }

    /// Entry under `key`, or `default` when the key is absent.
    fn get_or(&self, key: &str, default: Entry) -> Result<Entry> {
        match self.get(key) {
            Err(TensorDictError::KeyNotFound(_)) => Ok(default),
            other => other,
        }
    }

    /// Leaf tensor under `key`; `KindMismatch` for nested containers.
    fn get_tensor(&self, key: &str) -> Result<Tensor> {
        self.get(key)?.into_tensor(key)
    }

    /// Nested container under `key`; `KindMismatch` for leaves.
    fn get_nested(&self, key: &str) -> Result<AnyTensorDict> {
        self.get(key)?.into_nested(key)
    }

    /// Follow `path` through nested containers.
    fn get_path(&self, path: &[&str]) -> Result<Entry> {
        let (last, parents) = path
            .split_last()
            .ok_or_else(|| TensorDictError::KeyNotFound(String::new()))?;
        let mut td = self.to_any();
        for key in parents {
            td = td.get_nested(key)?;
        }
        td.get(last)
    }

    /// Set `path`, creating empty intermediate containers as needed.
    fn set_path(&self, path: &[&str], value: impl Into<Entry>) -> Result<()>
    where
        Self: Sized,
    {
        utils::set_path(&self.to_any(), path, value.into())
    }

    fn items(&self) -> Result<Vec<(String, Entry)>> {
        self.key_list()
            .into_iter()
            .map(|k| {
                let e = self.get(&k)?;
                Ok((k, e))
            })
            .collect()
    }

    fn values(&self) -> Result<Vec<Entry>> {
        self.key_list().iter().map(|k| self.get(k)).collect()
    }

    // =========================================================================
    // In-place writes
    // =========================================================================

    /// Copy `value` into the region `idx` of the leaf under `key`.
    fn set_at(&self, key: &str, idx: &[TensorIndex], value: &Tensor) -> Result<()> {
        utils::default_set_at(self, key, idx, value)
    }

    /// Fill the leaf under `key` (or every leaf of a nested container).
    fn fill_(&self, key: &str, value: f64) -> Result<()> {
        match self.get(key)? {
            Entry::Tensor(_) => self.set_at(key, &[], &Tensor::from_f64(&[value], &[])),
            Entry::Nested(td) => td
                .key_list()
                .iter()
                .try_for_each(|k| td.fill_(k, value)),
        }
    }

    fn zero_(&self) -> Result<()> {
        self.key_list().iter().try_for_each(|k| self.fill_(k, 0.0))
    }

    /// Set every batch element selected by `mask` to `value`.
    fn masked_fill_(&self, mask: &Tensor, value: f64) -> Result<()> {
        utils::check_mask(&self.batch_size(), mask)?;
        let idx = [TensorIndex::Mask(mask.clone())];
        let fill = Tensor::from_f64(&[value], &[]);
        for key in self.key_list() {
            match self.get(&key)? {
                Entry::Tensor(_) => self.set_at(&key, &idx, &fill)?,
                Entry::Nested(td) => td.masked_fill_(mask, value)?,
            }
        }
        Ok(())
    }

    /// `set` every entry of `other` into this container.
    fn update(&self, other: &impl TensorDictBase) -> Result<()>
    where
        Self: Sized,
    {
        utils::update(&self.to_any(), &other.to_any())
    }

    /// Copy every entry of `other` into the existing entries (write-through).
    fn update_(&self, other: &impl TensorDictBase) -> Result<()>
    where
        Self: Sized,
    {
        utils::update_inplace(&self.to_any(), &other.to_any())
    }

    /// Replace every leaf by `f(leaf)`, in place.
    fn apply_<F>(&self, f: F) -> Result<()>
    where
        Self: Sized,
        F: Fn(&Tensor) -> kore_core::Result<Tensor>,
    {
        utils::apply_inplace(&self.to_any(), &f)
    }

    // =========================================================================
    // Eager derived containers
    // =========================================================================

    /// New eager container with every leaf mapped through `f`.
    fn apply<F>(&self, f: F) -> Result<TensorDict>
    where
        Self: Sized,
        F: Fn(&Tensor) -> kore_core::Result<Tensor>,
    {
        utils::apply(&self.to_any(), &f)
    }

    /// New eager container holding only `keys` (leaves are shared).
    fn select(&self, keys: &[&str]) -> Result<TensorDict> {
        let out = TensorDict::empty(self.batch_size(), self.device());
        for key in keys {
            out.insert_unchecked(key, self.get(key)?);
        }
        Ok(out)
    }

    /// New eager container without `keys` (leaves are shared).
    fn exclude(&self, keys: &[&str]) -> Result<TensorDict> {
        let out = TensorDict::empty(self.batch_size(), self.device());
        for key in self.key_list() {
            if !keys.contains(&key.as_str()) {
                out.insert_unchecked(&key, self.get(&key)?);
            }
        }
        Ok(out)
    }

    fn rename_key(&self, old: &str, new: &str) -> Result<()> {
        if old == new {
            return self.get(old).map(|_| ());
        }
        let value = self.get(old)?;
        self.set_entry(new, value)?;
        self.del(old)
    }

    /// Eager container whose nested entries are flattened into `a.b` keys.
    fn flatten_keys(&self, sep: &str) -> Result<TensorDict> {
        let out = TensorDict::empty(self.batch_size(), self.device());
        utils::flatten_into(&out, &self.to_any(), "", sep)?;
        Ok(out)
    }

    /// Inverse of [`flatten_keys`](Self::flatten_keys).
    fn unflatten_keys(&self, sep: &str) -> Result<TensorDict> {
        let out = TensorDict::empty(self.batch_size(), self.device());
        for key in self.key_list() {
            let value = self.get(&key)?;
            let path: Vec<&str> = key.split(sep).collect();
            utils::set_path(&out.to_any(), &path, value)?;
        }
        Ok(out)
    }

    /// Eager container broadcast to `batch_size` (leaves alias with stride 0).
    fn expand(&self, batch_size: &[usize]) -> Result<TensorDict> {
        let batch = self.batch_size();
        let lead = batch_size.len().checked_sub(batch.ndim()).ok_or_else(|| {
            TensorDictError::ShapeMismatch(format!(
                "cannot expand batch size {batch} to {batch_size:?}"
            ))
        })?;
        let out = TensorDict::empty(Shape::new(batch_size), self.device());
        for key in self.key_list() {
            let value = match self.get(&key)? {
                Entry::Tensor(t) => {
                    let target = Shape::new(batch_size).concat(t.shape().trailing(batch.ndim()));
                    Entry::Tensor(t.expand(target.dims()).map_err(|_| {
                        TensorDictError::ShapeMismatch(format!(
                            "cannot expand \"{key}\" of shape {} to {target}",
                            t.shape()
                        ))
                    })?)
                }
                Entry::Nested(td) => {
                    let nested = td.batch_size();
                    let target = Shape::new(batch_size).concat(nested.trailing(batch.ndim()));
                    Entry::Nested(td.expand(target.dims())?.into())
                }
            };
            out.insert_unchecked(&key, value);
        }
        debug!(from = %batch, to = ?batch_size, lead, "expanded container");
        Ok(out)
    }

    /// Structural and value equality (same batch size, keys and leaves).
    fn equal(&self, other: &impl TensorDictBase) -> Result<bool>
    where
        Self: Sized,
    {
        utils::equal(&self.to_any(), &other.to_any())
    }

    /// Freshly allocated eager container with the same content. Breaks aliasing.
    fn materialize(&self) -> Result<TensorDict> {
        utils::materialize(self)
    }

    /// Eager container with the same content; eager containers return
    /// themselves.
    fn contiguous(&self) -> Result<TensorDict> {
        self.materialize()
    }

    /// Deep copy. Always eager, even for views.
    fn deep_clone(&self) -> Result<TensorDict> {
        self.materialize()
    }

    /// New eager container with every leaf on `device`.
    fn to(&self, device: Device) -> Result<TensorDict> {
        let out = TensorDict::empty(self.batch_size(), Some(device));
        for key in self.key_list() {
            out.insert_unchecked(&key, self.get(&key)?.to(device)?);
        }
        debug!(%device, batch_size = %out.batch_size(), "moved container");
        Ok(out)
    }

    // =========================================================================
    // Indexing
    // =========================================================================

    /// Index the batch dimensions.
    ///
    /// - a boolean mask gives an eager container with batch `[count] + rest`;
    /// - integer selections or lists give an eager container whose leaves
    ///   alias the source;
    /// - slices give a [`SubTensorDict`].
    fn index(&self, idx: &[TensorIndex]) -> Result<AnyTensorDict> {
        utils::default_index(self, idx)
    }

    /// Explicit write-through view at `idx`.
    fn get_sub_tensordict(&self, idx: &[TensorIndex]) -> Result<SubTensorDict> {
        SubTensorDict::new(self.to_any(), idx.to_vec())
    }

    /// Batch elements selected by a boolean mask over the leading batch dims.
    fn masked_select(&self, mask: &Tensor) -> Result<TensorDict> {
        utils::check_mask(&self.batch_size(), mask)?;
        utils::index_eager(self, &[TensorIndex::Mask(mask.clone())])
    }

    /// Sub-views of at most `split_size` along `dim`.
    fn split(&self, split_size: usize, dim: isize) -> Result<Vec<AnyTensorDict>> {
        let d = utils::batch_axis(&self.batch_size(), dim, 0)?;
        if split_size == 0 {
            return Err(TensorDictError::ShapeMismatch("split size must be positive".into()));
        }
        let size = self.batch_size().dims()[d];
        let mut views = Vec::new();
        let mut start = 0;
        while start < size {
            let stop = (start + split_size).min(size);
            let mut idx = vec![TensorIndex::Full; d];
            idx.push(TensorIndex::slice(start as isize, stop as isize));
            views.push(self.get_sub_tensordict(&idx)?.into());
            start = stop;
        }
        Ok(views)
    }

    /// One container per index of `dim`, with that dimension removed.
    fn unbind(&self, dim: isize) -> Result<Vec<AnyTensorDict>> {
        let d = utils::batch_axis(&self.batch_size(), dim, 0)?;
        (0..self.batch_size().dims()[d])
            .map(|i| {
                let mut idx = vec![TensorIndex::Full; d];
                idx.push(TensorIndex::Select(i as isize));
                self.index(&idx)
            })
            .collect()
    }

    // =========================================================================
    // Lazy structural views
    // =========================================================================

    fn unsqueeze(&self, dim: isize) -> Result<AnyTensorDict> {
        utils::default_unsqueeze(self, dim)
    }

    /// Remove `dim` if it has size 1; otherwise return this container.
    fn squeeze(&self, dim: isize) -> Result<AnyTensorDict> {
        utils::default_squeeze(self, dim)
    }

    /// Reshape the batch dimensions (one `-1` may be inferred).
    fn view(&self, batch_size: &[isize]) -> Result<AnyTensorDict> {
        utils::default_view(self, batch_size)
    }

    /// Reorder the batch dimensions.
    fn permute(&self, order: &[usize]) -> Result<AnyTensorDict> {
        utils::default_permute(self, order)
    }

    // =========================================================================
    // Storage modes
    // =========================================================================

    fn is_shared(&self) -> bool {
        utils::all_leaves(self, |t| t.is_shared())
    }

    fn is_memmapped(&self) -> bool {
        utils::all_leaves(self, |t| t.is_memmapped())
    }

    /// Move every leaf to shared memory. Fails before touching any leaf if
    /// one of them cannot be moved.
    fn share_memory_(&self) -> Result<()> {
        utils::transition(self, kore_core::StorageMode::Shared)
    }

    /// Move every leaf to memory-mapped storage. Fails before touching any
    /// leaf if one of them cannot be moved.
    fn memmap_(&self) -> Result<()> {
        utils::transition(self, kore_core::StorageMode::MemoryMapped)
    }
}
