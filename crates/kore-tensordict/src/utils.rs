//! Algorithms shared by the container variants.
//!
//! The trait's default methods delegate here so that variants overriding a
//! method can still fall back to the generic behaviour.

use kore_core::shape::normalize_axis;
use kore_core::{index_shape, DType, Device, Shape, StorageMode, Tensor, TensorIndex};
use tracing::{debug, trace};

use crate::any::AnyTensorDict;
use crate::base::TensorDictBase;
use crate::entry::Entry;
use crate::error::{Result, TensorDictError};
use crate::lazy::{PermutedTensorDict, UnsqueezedTensorDict, ViewedTensorDict};
use crate::sub::SubTensorDict;
use crate::tensordict::TensorDict;

// =============================================================================
// Validation
// =============================================================================

/// `value` must have `batch` as a shape prefix and sit on `device` (if set).
pub(crate) fn check_entry(
    key: &str,
    value: &Entry,
    batch: &Shape,
    device: Option<Device>,
) -> Result<()> {
    let shape = value.shape();
    if !shape.starts_with(batch.dims()) {
        return Err(TensorDictError::BatchSizeMismatch {
            key: key.to_string(),
            expected: batch.clone(),
            got: shape,
        });
    }
    if let (Some(expected), Some(got)) = (device, value.device()) {
        if expected != got {
            return Err(TensorDictError::DeviceMismatch {
                key: key.to_string(),
                expected,
                got,
            });
        }
    }
    Ok(())
}

/// Batch shape after applying `idx`, with tensor index errors remapped.
pub(crate) fn checked_index_shape(batch: &Shape, idx: &[TensorIndex]) -> Result<Shape> {
    Ok(index_shape(batch.dims(), idx)?)
}

pub(crate) fn check_mask(batch: &Shape, mask: &Tensor) -> Result<()> {
    if mask.dtype() != DType::Bool {
        return Err(TensorDictError::IndexOutOfRange(format!(
            "mask must be bool, got {}",
            mask.dtype()
        )));
    }
    if mask.ndim() == 0 || !batch.starts_with(mask.shape().dims()) {
        return Err(TensorDictError::IndexOutOfRange(format!(
            "mask of shape {} does not match the leading dims of batch size {batch}",
            mask.shape()
        )));
    }
    Ok(())
}

/// Normalize a batch axis; `extra` widens the range for insertion points.
pub(crate) fn batch_axis(batch: &Shape, dim: isize, extra: usize) -> Result<usize> {
    normalize_axis(dim, batch.ndim(), extra).ok_or_else(|| {
        TensorDictError::IndexOutOfRange(format!(
            "dimension {dim} out of range for batch size {batch}"
        ))
    })
}

pub(crate) fn is_identity(order: &[usize]) -> bool {
    order.iter().enumerate().all(|(i, &o)| i == o)
}

pub(crate) fn check_permutation(order: &[usize], ndim: usize) -> Result<()> {
    let mut seen = vec![false; ndim];
    let valid = order.len() == ndim
        && order.iter().all(|&o| {
            let fresh = o < ndim && !seen[o];
            if fresh {
                seen[o] = true;
            }
            fresh
        });
    if !valid {
        return Err(TensorDictError::ShapeMismatch(format!(
            "{order:?} is not a permutation of {ndim} batch dimension(s)"
        )));
    }
    Ok(())
}

// =============================================================================
// Index mapping
// =============================================================================

/// Where a batch dimension lands within an index expression.
pub(crate) enum Located {
    /// Consumed by `idx[pos]`; `out` is the output dim of that item.
    Item { pos: usize, out: usize },
    /// Not reached by `idx`; kept whole at output dim `out`.
    Implicit { out: usize },
}

pub(crate) fn locate(idx: &[TensorIndex], dim: usize) -> Located {
    let (mut d, mut out) = (0, 0);
    for (pos, item) in idx.iter().enumerate() {
        let span = item.span();
        if span > 0 && dim < d + span {
            return Located::Item { pos, out };
        }
        d += span;
        if !item.is_select() {
            out += 1;
        }
    }
    Located::Implicit {
        out: out + (dim - d),
    }
}

/// `idx` without the item at `pos`.
pub(crate) fn without(idx: &[TensorIndex], pos: usize) -> Vec<TensorIndex> {
    idx.iter()
        .enumerate()
        .filter(|&(i, _)| i != pos)
        .map(|(_, item)| item.clone())
        .collect()
}

/// Drop trailing items that keep their dimension whole.
pub(crate) fn trim_full(idx: &[TensorIndex]) -> &[TensorIndex] {
    let keep = idx
        .iter()
        .rposition(|item| !item.is_full())
        .map_or(0, |p| p + 1);
    &idx[..keep]
}

// =============================================================================
// Default structural operations
// =============================================================================

pub(crate) fn default_index<T>(td: &T, idx: &[TensorIndex]) -> Result<AnyTensorDict>
where
    T: TensorDictBase + ?Sized,
{
    checked_index_shape(&td.batch_size(), idx)?;
    let idx = trim_full(idx);
    if idx.is_empty() {
        return Ok(td.to_any());
    }
    if idx.iter().any(|i| i.is_select() || i.is_advanced()) {
        Ok(index_eager(td, idx)?.into())
    } else {
        Ok(SubTensorDict::new(td.to_any(), idx.to_vec())?.into())
    }
}

/// Eager container whose entries are `entry[idx]` (aliasing the source).
pub(crate) fn index_eager<T>(td: &T, idx: &[TensorIndex]) -> Result<TensorDict>
where
    T: TensorDictBase + ?Sized,
{
    let batch = checked_index_shape(&td.batch_size(), idx)?;
    let out = TensorDict::empty(batch, td.device());
    for key in td.key_list() {
        out.insert_unchecked(&key, td.get(&key)?.index(idx)?);
    }
    Ok(out)
}

pub(crate) fn default_unsqueeze<T>(td: &T, dim: isize) -> Result<AnyTensorDict>
where
    T: TensorDictBase + ?Sized,
{
    let d = batch_axis(&td.batch_size(), dim, 1)?;
    Ok(UnsqueezedTensorDict::new(td.to_any(), d)?.into())
}

pub(crate) fn default_squeeze<T>(td: &T, dim: isize) -> Result<AnyTensorDict>
where
    T: TensorDictBase + ?Sized,
{
    let batch = td.batch_size();
    let d = batch_axis(&batch, dim, 0)?;
    if batch.dims()[d] != 1 {
        return Ok(td.to_any());
    }
    Ok(ViewedTensorDict::new(td.to_any(), batch.removed(d))?.into())
}

pub(crate) fn default_view<T>(td: &T, batch_size: &[isize]) -> Result<AnyTensorDict>
where
    T: TensorDictBase + ?Sized,
{
    let batch = td.batch_size();
    let target = batch.resolve_reshape(batch_size).ok_or_else(|| {
        TensorDictError::ShapeMismatch(format!(
            "cannot view batch size {batch} as {batch_size:?}"
        ))
    })?;
    if target == batch {
        return Ok(td.to_any());
    }
    Ok(ViewedTensorDict::new(td.to_any(), target)?.into())
}

pub(crate) fn default_permute<T>(td: &T, order: &[usize]) -> Result<AnyTensorDict>
where
    T: TensorDictBase + ?Sized,
{
    check_permutation(order, td.batch_dims())?;
    if is_identity(order) {
        return Ok(td.to_any());
    }
    Ok(PermutedTensorDict::new(td.to_any(), order.to_vec())?.into())
}

// =============================================================================
// In-place writes
// =============================================================================

pub(crate) fn default_set_at<T>(td: &T, key: &str, idx: &[TensorIndex], value: &Tensor) -> Result<()>
where
    T: TensorDictBase + ?Sized,
{
    checked_index_shape(&td.batch_size(), idx)?;
    let target = td.get_tensor(key)?.index(idx)?;
    target.copy_(value)?;
    Ok(())
}

/// In-place write for containers whose reads are copies: patch the region
/// in the copy, then hand the whole leaf to `back` to store it.
pub(crate) fn write_back<T, F>(
    td: &T,
    key: &str,
    idx: &[TensorIndex],
    value: &Tensor,
    back: F,
) -> Result<()>
where
    T: TensorDictBase + ?Sized,
    F: FnOnce(&Tensor) -> Result<()>,
{
    checked_index_shape(&td.batch_size(), idx)?;
    let full = td.get_tensor(key)?;
    full.index(idx)?.copy_(value)?;
    trace!(key, "writing back patched leaf");
    back(&full)
}

// =============================================================================
// Copies
// =============================================================================

pub(crate) fn materialize<T>(td: &T) -> Result<TensorDict>
where
    T: TensorDictBase + ?Sized,
{
    let out = TensorDict::empty(td.batch_size(), td.device());
    for key in td.key_list() {
        out.insert_unchecked(&key, td.get(&key)?.deep_clone()?);
    }
    debug!(batch_size = %out.batch_size(), keys = out.len(), "materialized container");
    Ok(out)
}

pub(crate) fn equal(a: &AnyTensorDict, b: &AnyTensorDict) -> Result<bool> {
    if a.batch_size() != b.batch_size() {
        return Ok(false);
    }
    let mut keys_a = a.key_list();
    let mut keys_b = b.key_list();
    keys_a.sort();
    keys_b.sort();
    if keys_a != keys_b {
        return Ok(false);
    }
    for key in &keys_a {
        if !a.get(key)?.equal(&b.get(key)?)? {
            return Ok(false);
        }
    }
    Ok(true)
}

// =============================================================================
// Mapping and updates
// =============================================================================

type LeafFn<'a> = &'a dyn Fn(&Tensor) -> kore_core::Result<Tensor>;

pub(crate) fn apply(td: &AnyTensorDict, f: LeafFn<'_>) -> Result<TensorDict> {
    let out = TensorDict::empty(td.batch_size(), None);
    for key in td.key_list() {
        let value = match td.get(&key)? {
            Entry::Tensor(t) => Entry::Tensor(f(&t)?),
            Entry::Nested(nested) => Entry::Nested(apply(&nested, f)?.into()),
        };
        out.set_entry(&key, value)?;
    }
    Ok(out)
}

pub(crate) fn apply_inplace(td: &AnyTensorDict, f: LeafFn<'_>) -> Result<()> {
    for key in td.key_list() {
        match td.get(&key)? {
            Entry::Tensor(t) => td.set_at(&key, &[], &f(&t)?)?,
            Entry::Nested(nested) => apply_inplace(&nested, f)?,
        }
    }
    Ok(())
}

pub(crate) fn update(td: &AnyTensorDict, other: &AnyTensorDict) -> Result<()> {
    for key in other.key_list() {
        let value = other.get(&key)?;
        match (td.get(&key), &value) {
            (Ok(Entry::Nested(dst)), Entry::Nested(src)) => update(&dst, src)?,
            _ => td.set_entry(&key, value)?,
        }
    }
    Ok(())
}

pub(crate) fn update_inplace(td: &AnyTensorDict, other: &AnyTensorDict) -> Result<()> {
    for key in other.key_list() {
        match (td.get(&key)?, other.get(&key)?) {
            (Entry::Tensor(_), Entry::Tensor(src)) => td.set_at(&key, &[], &src)?,
            (Entry::Nested(dst), Entry::Nested(src)) => update_inplace(&dst, &src)?,
            (dst, src) => {
                return Err(TensorDictError::KindMismatch {
                    key,
                    expected: dst.kind_name(),
                    found: src.kind_name(),
                })
            }
        }
    }
    Ok(())
}

pub(crate) fn set_path(td: &AnyTensorDict, path: &[&str], value: Entry) -> Result<()> {
    let (last, parents) = path
        .split_last()
        .ok_or_else(|| TensorDictError::KeyNotFound(String::new()))?;
    let mut node = td.clone();
    for key in parents {
        node = match node.get(key) {
            Ok(entry) => entry.into_nested(key)?,
            Err(TensorDictError::KeyNotFound(_)) => {
                let child = TensorDict::empty(node.batch_size(), node.device());
                node.set_entry(key, Entry::Nested(child.clone().into()))?;
                child.into()
            }
            Err(e) => return Err(e),
        };
    }
    node.set_entry(last, value)
}

pub(crate) fn flatten_into(
    out: &TensorDict,
    td: &AnyTensorDict,
    prefix: &str,
    sep: &str,
) -> Result<()> {
    for key in td.key_list() {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}{sep}{key}")
        };
        match td.get(&key)? {
            Entry::Tensor(t) => out.insert_unchecked(&full, Entry::Tensor(t)),
            Entry::Nested(nested) => flatten_into(out, &nested, &full, sep)?,
        }
    }
    Ok(())
}

// =============================================================================
// Storage modes
// =============================================================================

pub(crate) fn leaves<T>(td: &T) -> Result<Vec<(String, Tensor)>>
where
    T: TensorDictBase + ?Sized,
{
    let mut out = Vec::new();
    for key in td.key_list() {
        match td.get(&key)? {
            Entry::Tensor(t) => out.push((key, t)),
            Entry::Nested(nested) => out.extend(
                leaves(&nested)?
                    .into_iter()
                    .map(|(k, t)| (format!("{key}.{k}"), t)),
            ),
        }
    }
    Ok(out)
}

pub(crate) fn all_leaves<T>(td: &T, pred: impl Fn(&Tensor) -> bool) -> bool
where
    T: TensorDictBase + ?Sized,
{
    match leaves(td) {
        Ok(leaves) => !leaves.is_empty() && leaves.iter().all(|(_, t)| pred(t)),
        Err(_) => false,
    }
}

/// Fail if any leaf of `td` cannot move to `mode`; returns the leaf count.
pub(crate) fn check_transition<T>(td: &T, mode: StorageMode) -> Result<usize>
where
    T: TensorDictBase + ?Sized,
{
    let leaves = leaves(td)?;
    for (key, t) in &leaves {
        let current = t.storage_mode();
        let blocked = match mode {
            StorageMode::Private => false,
            StorageMode::Shared => current == StorageMode::MemoryMapped,
            StorageMode::MemoryMapped => {
                current == StorageMode::Shared || !t.device().supports_memmap()
            }
        };
        if blocked {
            return Err(TensorDictError::Tensor(kore_core::KoreError::InvalidStorageMode {
                from: current,
                to: mode,
                reason: format!("leaf \"{key}\" on {} cannot be moved", t.device()),
            }));
        }
    }
    Ok(leaves.len())
}

/// Validate every leaf can move to `mode`, then move them all.
pub(crate) fn transition<T>(td: &T, mode: StorageMode) -> Result<()>
where
    T: TensorDictBase + ?Sized,
{
    let count = check_transition(td, mode)?;
    for key in td.key_list() {
        trace!(key = %key, ?mode, "moving entry storage");
        td.get(&key)?.apply_mode(mode)?;
    }
    debug!(?mode, leaves = count, "storage mode transition");
    Ok(())
}
