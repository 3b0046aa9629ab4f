use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use derive_new::new;

use crate::tensor::{DType, Tensor};
use crate::value::DecodedValue;

/// Hyperparameters of one saved param group: every entry except `params`, copied as saved.
pub type Hyperparameters = BTreeMap<String, DecodedValue>;

/// Per-parameter optimizer buffers (`exp_avg`, `step`, ...) keyed by name. Values are
/// materialized tensors or plain scalars.
pub type ParamState = BTreeMap<String, DecodedValue>;

/// A live optimizer, seen as an ordered list of param groups.
///
/// Saved state is matched by position: saved group `i` goes to group `i`, and the `k`-th
/// ordinal in a saved group's `params` list goes to the `k`-th parameter of that group.
///
/// The setters are only called once the whole saved state has been validated, so they cannot
/// fail.
pub trait OptimizerTarget {
    fn group_count(&self) -> usize;

    /// Shapes of the parameters of `group`, in declared order.
    fn param_shapes(&self, group: usize) -> Vec<Vec<usize>>;

    /// Replace the hyperparameters of `group`.
    fn set_hyperparameters(&mut self, group: usize, hyperparameters: Hyperparameters);

    /// Replace the state of the `param`-th parameter of `group`. An empty map means the
    /// optimizer has not stepped this parameter yet.
    fn set_param_state(&mut self, group: usize, param: usize, state: ParamState);
}

/// A named tensor slot of a live module.
#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct TensorSlot {
    /// Dotted path, e.g. `encoder.layers.0.weight`.
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// A live module, seen as a set of named tensor slots.
pub trait ModuleTarget {
    fn slots(&self) -> Vec<TensorSlot>;

    /// Fill the slot `name`. Called only after every tensor has been validated.
    fn load_tensor(&mut self, name: &str, tensor: Tensor);
}
