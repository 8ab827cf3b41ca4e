//! # kore-core
//!
//! Leaf tensor backend for the Kore tensor containers.
//!
//! Provides the `Tensor` type with:
//! - F32, F64, I64 and Bool dtypes
//! - Placement tags (CPU and CUDA ordinals) carried by every storage
//! - Views for every structural operation, including integer-list and
//!   boolean-mask indexing, with write-through to the source storage
//! - Shared and memory-mapped storage modes

pub mod device;
pub mod dtype;
pub mod error;
pub mod index;
pub mod ops;
pub mod prelude;
pub mod shape;
pub mod storage;
pub mod tensor;

pub use device::Device;
pub use dtype::DType;
pub use error::KoreError;
pub use index::{index_shape, TensorIndex};
pub use shape::Shape;
pub use storage::{Buffer, Element, Storage, StorageMode};
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, KoreError>;
