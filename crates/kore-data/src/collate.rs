use kore_tensordict::{stack_eager, TensorDict, TensorDictBase};
use tracing::trace;

use crate::error::{DataError, Result};

/// Stack sample containers along a new leading dimension.
///
/// Every sample must hold the same keys with matching shapes; the result
/// has batch size `[samples.len()] + sample batch size` and owns its data.
pub fn collate<T: TensorDictBase>(samples: &[T]) -> Result<TensorDict> {
    if samples.is_empty() {
        return Err(DataError::InvalidInput("cannot collate an empty batch".into()));
    }
    let batch = stack_eager(samples, 0)?;
    trace!(samples = samples.len(), batch_size = %batch.batch_size(), "collated batch");
    Ok(batch)
}
