//! Deferred structural transforms.
//!
//! Each view holds its source handle(s) plus a transform descriptor and
//! computes its batch size once at construction. Leaves are transformed
//! on every read (as aliasing tensor views where possible) and writes are
//! routed back through the inverse transform. Call `materialize()` to pay
//! the transform once and obtain an owning eager container.
//!
//! A view records the batch size its source had at construction; if the
//! source is later reshaped, every access fails with `StaleReference`.

mod permuted;
mod stacked;
mod unsqueezed;
mod viewed;

pub use permuted::PermutedTensorDict;
pub use stacked::LazyStackedTensorDict;
pub use unsqueezed::UnsqueezedTensorDict;
pub use viewed::ViewedTensorDict;

pub(crate) use stacked::check_same_keys;

use kore_core::Shape;

use crate::any::AnyTensorDict;
use crate::base::TensorDictBase;
use crate::error::{Result, TensorDictError};

fn check_source(view: &str, source: &AnyTensorDict, recorded: &Shape) -> Result<()> {
    let now = source.batch_size();
    if &now != recorded {
        return Err(TensorDictError::StaleReference(format!(
            "{view} was built over batch size {recorded} but its source now has {now}"
        )));
    }
    Ok(())
}

fn read_only_batch(view: &str, batch_size: &[usize]) -> TensorDictError {
    TensorDictError::ShapeMismatch(format!(
        "cannot set batch size {batch_size:?} on a {view}; materialize it first"
    ))
}
