//! Apply decoded state onto live optimizers and modules.
//!
//! Two shapes of saved state are understood:
//!
//! - **Optimizer state** (`optimizer.state_dict()`): `{"state": {ordinal: {buffer: value}},
//!   "param_groups": [{"params": [ordinal, ...], hyperparameter: value, ...}]}`. Parameters are
//!   only recorded as integer ordinals, so groups and parameters are matched by position.
//! - **Module state** (`model.state_dict()`): a flat `{dotted name: tensor}` mapping, matched
//!   by name.
//!
//! Every apply validates the whole saved state against the target before the first setter is
//! called. A failed apply leaves the target untouched.

mod module;
mod optimizer;
mod options;
mod report;
mod target;

#[cfg(test)]
mod tests;

pub use options::{GroupCountPolicy, ModuleLoadOptions, OptimizerLoadOptions, UnmatchedPolicy};
pub use report::ApplyReport;
pub use target::{Hyperparameters, ModuleTarget, OptimizerTarget, ParamState, TensorSlot};

use crate::error::MappingError;
use crate::value::DecodedValue;

/// Apply a saved optimizer state. The saved and live optimizers must have the same number of
/// param groups.
pub fn apply_optimizer_state<T: OptimizerTarget + ?Sized>(
    root: &DecodedValue,
    optimizer: &mut T,
) -> Result<(), MappingError> {
    apply_optimizer_state_with(root, optimizer, &OptimizerLoadOptions::default()).map(|_| ())
}

pub fn apply_optimizer_state_with<T: OptimizerTarget + ?Sized>(
    root: &DecodedValue,
    optimizer: &mut T,
    options: &OptimizerLoadOptions,
) -> Result<ApplyReport, MappingError> {
    optimizer::apply(root, optimizer, options)
}

/// Apply a saved module state with [`ModuleLoadOptions::strict`].
pub fn apply_module_state<T: ModuleTarget + ?Sized>(
    root: &DecodedValue,
    module: &mut T,
) -> Result<(), MappingError> {
    apply_module_state_with(root, module, &ModuleLoadOptions::strict()).map(|_| ())
}

pub fn apply_module_state_with<T: ModuleTarget + ?Sized>(
    root: &DecodedValue,
    module: &mut T,
    options: &ModuleLoadOptions,
) -> Result<ApplyReport, MappingError> {
    module::apply(root, module, options)
}
