use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use super::options::{ModuleLoadOptions, UnmatchedPolicy};
use super::report::ApplyReport;
use super::target::ModuleTarget;
use crate::error::MappingError;
use crate::tensor::Tensor;
use crate::value::DecodedValue;

pub(crate) fn apply<T: ModuleTarget + ?Sized>(
    root: &DecodedValue,
    target: &mut T,
    options: &ModuleLoadOptions,
) -> Result<ApplyReport, MappingError> {
    let root = root
        .as_dict()
        .ok_or_else(|| MappingError::invalid(format!("module state is a {}", root.kind())))?;
    let remapper = options.remapper()?;
    let is_skipped = |name: &str| options.skip.iter().any(|skip| skip == name);

    let mut report = ApplyReport::default();
    let mut saved: BTreeMap<String, &DecodedValue> = BTreeMap::new();
    for (key, value) in root.iter() {
        let key = key.as_str().ok_or_else(|| {
            MappingError::invalid(format!("module state has a {} key", key.kind()))
        })?;
        let name = remapper.remap(key);
        if is_skipped(key) || is_skipped(&name) {
            report.skipped.push(name);
            continue;
        }
        if name != key {
            log::debug!("Remapped '{key}' to '{name}'");
        }
        if saved.insert(name.clone(), value).is_some() {
            return Err(MappingError::invalid(format!(
                "more than one saved entry maps to '{name}'"
            )));
        }
    }

    let mut staged: Vec<(String, Tensor)> = Vec::new();
    for slot in target.slots() {
        if is_skipped(&slot.name) {
            if !report.skipped.contains(&slot.name) {
                report.skipped.push(slot.name);
            }
            continue;
        }
        let Some(value) = saved.remove(&slot.name) else {
            if !tolerate(options.missing, &slot.name, "has no saved tensor") {
                return Err(MappingError::MissingTensor { name: slot.name });
            }
            report.missing.push(slot.name);
            continue;
        };

        let tensor = match value {
            DecodedValue::Tensor(tensor) => tensor,
            DecodedValue::TensorRef(_) => {
                return Err(MappingError::invalid(format!(
                    "tensor '{}' is not materialized",
                    slot.name
                )));
            }
            _ => return Err(MappingError::NotATensor { name: slot.name }),
        };
        if tensor.shape() != slot.shape.as_slice() {
            return Err(MappingError::ShapeMismatch {
                param: slot.name,
                expected: slot.shape,
                found: tensor.shape().to_vec(),
            });
        }
        if options.validate_dtype && tensor.dtype() != slot.dtype {
            return Err(MappingError::DTypeMismatch {
                param: slot.name,
                expected: slot.dtype,
                found: tensor.dtype(),
            });
        }
        staged.push((slot.name, tensor.clone()));
    }

    for name in saved.into_keys() {
        if !tolerate(options.unexpected, &name, "has no target slot") {
            return Err(MappingError::UnexpectedTensor { name });
        }
        report.unexpected.push(name);
    }

    // Everything is valid, commit.
    for (name, tensor) in staged {
        target.load_tensor(&name, tensor);
        report.applied.push(name);
    }
    log::debug!(
        "Applied module state: {} loaded, {} missing, {} unexpected",
        report.applied.len(),
        report.missing.len(),
        report.unexpected.len()
    );

    Ok(report)
}

/// Whether an unmatched name may be left out under `policy`.
fn tolerate(policy: UnmatchedPolicy, name: &str, what: &str) -> bool {
    match policy {
        UnmatchedPolicy::Error => false,
        UnmatchedPolicy::Warn => {
            log::warn!("'{name}' {what}, skipping");
            true
        }
        UnmatchedPolicy::Ignore => true,
    }
}
