use crate::device::Device;
use crate::dtype::DType;
use crate::storage::StorageMode;

/// Errors raised by the tensor backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KoreError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("cannot reshape {numel} elements into {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<isize> },

    #[error("axis {axis} out of range for a {ndim}-d tensor")]
    InvalidAxis { axis: isize, ndim: usize },

    #[error("invalid index: {0}")]
    InvalidIndex(String),

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("device mismatch: expected {expected}, got {got}")]
    DeviceMismatch { expected: Device, got: Device },

    #[error("unsupported dtype for this operation: {0}")]
    UnsupportedDType(DType),

    #[error("cannot move {from:?} storage to {to:?}: {reason}")]
    InvalidStorageMode {
        from: StorageMode,
        to: StorageMode,
        reason: String,
    },

    #[error("storage error: {0}")]
    StorageError(String),
}
