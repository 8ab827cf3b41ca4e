//! Bridge between parameterised modules and containers.
//!
//! A module exposes its tensors through [`ParameterSource`]; they are
//! gathered into nested containers keyed by the dotted parameter names, and
//! a [`FunctionalModule`] is evaluated against explicitly supplied
//! parameter and buffer containers. [`ensemble_call`] maps a leading
//! ensemble dimension of the parameters onto independent evaluations.

use kore_core::{Shape, Tensor, TensorIndex};
use tracing::debug;

use crate::any::AnyTensorDict;
use crate::base::{TensorDictBase, NESTED_KEY_SEP};
use crate::entry::Entry;
use crate::error::{Result, TensorDictError};
use crate::stack::stack_eager;
use crate::tensordict::TensorDict;
use crate::utils;

/// Anything holding named parameter and buffer tensors.
pub trait ParameterSource {
    /// Trainable tensors with dotted names (`"encoder.weight"`).
    fn named_parameters(&self) -> Vec<(String, &Tensor)>;

    /// Non-trainable state with dotted names.
    fn named_buffers(&self) -> Vec<(String, &Tensor)> {
        Vec::new()
    }

    fn parameters_td(&self) -> Result<TensorDict> {
        params_from_named(self.named_parameters())
    }

    fn buffers_td(&self) -> Result<TensorDict> {
        params_from_named(self.named_buffers())
    }
}

/// A pure function of inputs, parameters and buffers.
pub trait FunctionalModule {
    fn forward(
        &self,
        inputs: &TensorDict,
        params: &AnyTensorDict,
        buffers: &AnyTensorDict,
    ) -> Result<TensorDict>;
}

impl<F> FunctionalModule for F
where
    F: Fn(&TensorDict, &AnyTensorDict, &AnyTensorDict) -> Result<TensorDict>,
{
    fn forward(
        &self,
        inputs: &TensorDict,
        params: &AnyTensorDict,
        buffers: &AnyTensorDict,
    ) -> Result<TensorDict> {
        self(inputs, params, buffers)
    }
}

/// Nested container (batch size `[]`) from dotted tensor names. Leaves are
/// shared with the caller, not copied.
pub fn params_from_named<'a>(
    named: impl IntoIterator<Item = (String, &'a Tensor)>,
) -> Result<TensorDict> {
    let td = TensorDict::empty(Shape::scalar(), None);
    let any = td.to_any();
    for (name, tensor) in named {
        let path: Vec<&str> = name.split(NESTED_KEY_SEP).collect();
        utils::set_path(&any, &path, Entry::Tensor(tensor.clone()))?;
    }
    Ok(td)
}

/// Inverse of [`params_from_named`]: every leaf with its dotted path.
pub fn named_from_params(params: &impl TensorDictBase) -> Result<Vec<(String, Tensor)>> {
    utils::leaves(params)
}

/// Evaluate `module` with the given parameters and buffers.
pub fn functional_call<M>(
    module: &M,
    inputs: &TensorDict,
    params: &impl TensorDictBase,
    buffers: &impl TensorDictBase,
) -> Result<TensorDict>
where
    M: FunctionalModule + ?Sized,
{
    module.forward(inputs, &params.to_any(), &buffers.to_any())
}

/// Evaluate `module` once per member of a parameter ensemble.
///
/// `params` carries the ensemble as its leading batch dimension `[E]`.
/// `buffers` either has the same leading dimension (one set per member) or
/// batch size `[]` (shared by all members). Outputs are stacked so the
/// result has batch size `[E] + output batch`.
pub fn ensemble_call<M>(
    module: &M,
    inputs: &TensorDict,
    params: &impl TensorDictBase,
    buffers: &impl TensorDictBase,
) -> Result<TensorDict>
where
    M: FunctionalModule + ?Sized,
{
    let members = *params.batch_size().dims().first().ok_or_else(|| {
        TensorDictError::ShapeMismatch(
            "ensemble parameters need a leading ensemble dimension".into(),
        )
    })?;
    let per_member_buffers = match buffers.batch_size().dims().first() {
        None => false,
        Some(&n) if n == members => true,
        Some(&n) => {
            return Err(TensorDictError::ShapeMismatch(format!(
                "buffers have leading dimension {n} but the ensemble has {members} members"
            )))
        }
    };

    let shared = buffers.to_any();
    let mut outputs = Vec::with_capacity(members);
    for i in 0..members {
        let at = [TensorIndex::Select(i as isize)];
        let member_params = params.index(&at)?;
        let member_buffers = if per_member_buffers {
            buffers.index(&at)?
        } else {
            shared.clone()
        };
        outputs.push(module.forward(inputs, &member_params, &member_buffers)?);
    }
    debug!(members, "evaluated ensemble");
    stack_eager(&outputs, 0)
}
