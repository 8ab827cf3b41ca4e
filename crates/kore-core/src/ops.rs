//! Tensor operations: arithmetic, comparison, manipulation.
//!
//! Arithmetic and comparison return new tensors (functional style).
//! In-place variants are suffixed with `_` (e.g., `copy_`, `fill_`).

pub mod arithmetic;
pub mod comparison;
pub mod manipulation;
