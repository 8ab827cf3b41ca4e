//! Convenience re-exports for common kore-core types.
//!
//! ```rust
//! use kore_core::prelude::*;
//! ```

pub use crate::DType;
pub use crate::Device;
pub use crate::KoreError;
pub use crate::Result;
pub use crate::Shape;
pub use crate::StorageMode;
pub use crate::Tensor;
pub use crate::TensorIndex;
