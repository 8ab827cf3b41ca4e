//! Stacking and concatenation across containers.
//!
//! `stack` is lazy by default and keeps the inputs addressable; `cat` is
//! always eager. Both require every input to hold exactly the same keys.

use kore_core::{Shape, Tensor};
use tracing::debug;

use crate::any::AnyTensorDict;
use crate::base::TensorDictBase;
use crate::entry::Entry;
use crate::error::{Result, TensorDictError};
use crate::lazy::{check_same_keys, LazyStackedTensorDict};
use crate::tensordict::TensorDict;
use crate::utils;

fn handles<T: TensorDictBase>(tds: &[T], op: &str) -> Result<Vec<AnyTensorDict>> {
    if tds.is_empty() {
        return Err(TensorDictError::ShapeMismatch(format!(
            "cannot {op} an empty sequence of containers"
        )));
    }
    Ok(tds.iter().map(TensorDictBase::to_any).collect())
}

/// Stack containers with identical batch sizes along a new dimension `dim`.
///
/// The result is a [`LazyStackedTensorDict`]: no leaf is copied until it is
/// read or the stack is materialized. Fails with `KeyMismatch` if the
/// inputs do not hold the same keys.
pub fn stack<T: TensorDictBase>(tds: &[T], dim: isize) -> Result<LazyStackedTensorDict> {
    let sources = handles(tds, "stack")?;
    let d = utils::batch_axis(&sources[0].batch_size(), dim, 1)?;
    LazyStackedTensorDict::new(sources, d)
}

/// [`stack`] followed by materialization.
pub fn stack_eager<T: TensorDictBase>(tds: &[T], dim: isize) -> Result<TensorDict> {
    stack(tds, dim)?.materialize()
}

/// Concatenate containers along existing batch dimension `dim`.
///
/// All other batch dimensions must match; the result's `dim` is the sum of
/// the inputs'. Always returns a freshly allocated eager container.
pub fn cat<T: TensorDictBase>(tds: &[T], dim: isize) -> Result<TensorDict> {
    let sources = handles(tds, "concatenate")?;
    let d = utils::batch_axis(&sources[0].batch_size(), dim, 0)?;
    let out = cat_any(&sources, d, "")?;
    debug!(inputs = sources.len(), dim = d, batch_size = %out.batch_size(), "concatenated containers");
    Ok(out)
}

fn cat_any(sources: &[AnyTensorDict], d: usize, prefix: &str) -> Result<TensorDict> {
    let first = &sources[0];
    let batch = first.batch_size();
    let mut total = 0;
    for td in sources {
        let other = td.batch_size();
        let compatible = other.ndim() == batch.ndim()
            && (0..batch.ndim()).all(|i| i == d || other.dims()[i] == batch.dims()[i]);
        if !compatible {
            return Err(TensorDictError::ShapeMismatch(format!(
                "cannot concatenate batch sizes {batch} and {other} along dimension {d}"
            )));
        }
        total += other.dims()[d];
    }
    check_same_keys(sources, prefix)?;

    let mut dims = batch.dims().to_vec();
    dims[d] = total;
    let out = TensorDict::empty(Shape::from(dims), first.device());
    for key in first.key_list() {
        let entries = sources
            .iter()
            .map(|td| td.get(&key))
            .collect::<Result<Vec<_>>>()?;
        let value = if entries[0].is_tensor() {
            let leaves = entries
                .into_iter()
                .map(|e| e.into_tensor(&key))
                .collect::<Result<Vec<_>>>()?;
            let refs: Vec<&Tensor> = leaves.iter().collect();
            Entry::Tensor(Tensor::cat(&refs, d as isize)?)
        } else {
            let nested = entries
                .into_iter()
                .map(|e| e.into_nested(&key))
                .collect::<Result<Vec<_>>>()?;
            Entry::Nested(cat_any(&nested, d, &format!("{prefix}{key}."))?.into())
        };
        out.set_entry(&key, value)?;
    }
    Ok(out)
}
