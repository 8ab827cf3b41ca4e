//! # kore-tensordict
//!
//! Batched, dictionary-like containers of named tensors.
//!
//! A [`TensorDict`] maps keys to leaf tensors or nested containers that all
//! share a leading batch shape, and lets them be indexed, reshaped, stacked
//! and moved as one unit. Structural operations return cheap views where
//! they can:
//! - [`SubTensorDict`]: an index into a parent, read/write-through
//! - [`UnsqueezedTensorDict`], [`ViewedTensorDict`], [`PermutedTensorDict`]:
//!   deferred batch transforms over a source
//! - [`LazyStackedTensorDict`]: several containers stacked without copying
//!
//! Every variant implements [`TensorDictBase`] and can be held uniformly as
//! an [`AnyTensorDict`]. `materialize()` turns any of them into a freshly
//! allocated eager container.

pub mod any;
pub mod base;
pub mod entry;
pub mod error;
pub mod functional;
pub mod keys;
pub mod lazy;
pub mod stack;
pub mod sub;
pub mod tensordict;

mod utils;

pub use any::{AnyTensorDict, TensorDictKind};
pub use base::{TensorDictBase, NESTED_KEY_SEP};
pub use entry::{Entry, EntryMeta};
pub use error::{Result, TensorDictError};
pub use functional::{
    ensemble_call, functional_call, named_from_params, params_from_named, FunctionalModule,
    ParameterSource,
};
pub use keys::{KeysIter, KeysView};
pub use lazy::{LazyStackedTensorDict, PermutedTensorDict, UnsqueezedTensorDict, ViewedTensorDict};
pub use stack::{cat, stack, stack_eager};
pub use sub::SubTensorDict;
pub use tensordict::TensorDict;
