//! Model state serialization.
//!
//! State dictionaries back the best-checkpoint mechanism in the training
//! loops: a deep snapshot of every parameter and buffer (batch norm
//! running statistics included), restorable into a model of the same
//! architecture. A JSON round-trip is provided for artifacts.

use std::collections::BTreeMap;

use super::module::Module;
use crate::autograd::Tensor;
use crate::error::{Result, TractError};

/// State dictionary: mapping from parameter names to tensor data and shapes.
pub type StateDict = BTreeMap<String, (Vec<f32>, Vec<usize>)>;

fn entry_name(prefix: &str, stem: &str) -> String {
    if prefix.is_empty() {
        stem.to_string()
    } else {
        format!("{prefix}.{stem}")
    }
}

/// Extract a deep copy of all parameters and buffers from a module.
///
/// Parameters are named by index, buffers by index under `buf.`, both
/// under the optional prefix and relying on the stable ordering of
/// `Module::parameters` and `Module::buffers`. Buffers carry the running
/// statistics of batch norm layers, so a restored model evaluates
/// identically rather than with the statistics it happens to hold.
pub fn state_dict<M: Module + ?Sized>(module: &M, prefix: &str) -> StateDict {
    let mut state = StateDict::new();

    for (i, param) in module.parameters().iter().enumerate() {
        let name = entry_name(prefix, &i.to_string());
        state.insert(name, (param.data().to_vec(), param.shape().to_vec()));
    }

    for (i, buffer) in module.buffers().into_iter().enumerate() {
        let name = entry_name(prefix, &format!("buf.{i}"));
        let len = buffer.len();
        state.insert(name, (buffer, vec![len]));
    }

    state
}

/// Load a state dictionary back into a module.
///
/// # Errors
///
/// Returns an error if a parameter or buffer is missing from the state
/// or its shape doesn't match the module's.
pub fn load_state_dict_into<M: Module + ?Sized>(
    module: &mut M,
    state: &StateDict,
    prefix: &str,
) -> Result<()> {
    let params = module.parameters_mut();

    for (i, param) in params.into_iter().enumerate() {
        let name = entry_name(prefix, &i.to_string());

        let (data, shape) = state.get(&name).ok_or_else(|| {
            TractError::Serialization(format!("Missing parameter '{name}' in state dict"))
        })?;

        if param.shape() != shape.as_slice() {
            return Err(TractError::shape_mismatch(
                format!("parameter '{name}'"),
                format!("{:?}", param.shape()),
                format!("{shape:?}"),
            ));
        }

        *param = Tensor::new(data, shape).requires_grad();
    }

    for (i, buffer) in module.buffers_mut().into_iter().enumerate() {
        let name = entry_name(prefix, &format!("buf.{i}"));

        let (data, _) = state.get(&name).ok_or_else(|| {
            TractError::Serialization(format!("Missing buffer '{name}' in state dict"))
        })?;

        if data.len() != buffer.len() {
            return Err(TractError::shape_mismatch(
                format!("buffer '{name}'"),
                format!("length {}", buffer.len()),
                format!("length {}", data.len()),
            ));
        }

        buffer.copy_from_slice(data);
    }

    Ok(())
}

/// Serialize a module's parameters to a JSON string.
pub fn to_json<M: Module + ?Sized>(module: &M) -> Result<String> {
    let state = state_dict(module, "");
    Ok(serde_json::to_string(&state)?)
}

/// Deserialize a state dictionary from a JSON string.
pub fn from_json(json: &str) -> Result<StateDict> {
    Ok(serde_json::from_str(json)?)
}
