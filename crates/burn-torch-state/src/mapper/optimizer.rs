use alloc::collections::BTreeSet;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::options::{GroupCountPolicy, OptimizerLoadOptions};
use super::report::ApplyReport;
use super::target::{Hyperparameters, OptimizerTarget, ParamState};
use crate::error::MappingError;
use crate::value::{DecodedValue, Dict};

const STATE_KEY: &str = "state";
const PARAM_GROUPS_KEY: &str = "param_groups";
const PARAMS_KEY: &str = "params";

/// A validated group, ready to commit.
struct StagedGroup {
    hyperparameters: Hyperparameters,
    params: Vec<ParamState>,
}

pub(crate) fn apply<T: OptimizerTarget + ?Sized>(
    root: &DecodedValue,
    target: &mut T,
    options: &OptimizerLoadOptions,
) -> Result<ApplyReport, MappingError> {
    let root = root
        .as_dict()
        .ok_or_else(|| MappingError::invalid(format!("optimizer state is a {}", root.kind())))?;
    let state = root
        .get_str(STATE_KEY)
        .and_then(DecodedValue::as_dict)
        .ok_or_else(|| MappingError::invalid("optimizer state has no 'state' mapping"))?;
    let groups = root
        .get_str(PARAM_GROUPS_KEY)
        .and_then(DecodedValue::as_sequence)
        .ok_or_else(|| MappingError::invalid("optimizer state has no 'param_groups' list"))?;

    let target_groups = target.group_count();
    if groups.len() != target_groups {
        match options.group_count {
            GroupCountPolicy::Strict => {
                return Err(MappingError::ParamGroupCountMismatch {
                    saved: groups.len(),
                    target: target_groups,
                });
            }
            GroupCountPolicy::Prefix => log::warn!(
                "Saved optimizer has {} param groups, target has {target_groups}; \
                 loading the first {}",
                groups.len(),
                groups.len().min(target_groups)
            ),
        }
    }

    let mut report = ApplyReport::default();
    let mut listed = BTreeSet::new();
    let mut staged = Vec::new();
    for (index, group) in groups.iter().enumerate() {
        let ordinals = group_ordinals(index, group)?;
        listed.extend(ordinals.iter().copied());
        if index >= target_groups {
            report.skipped.push(format!("{PARAM_GROUPS_KEY}.{index}"));
            continue;
        }
        staged.push(stage_group(index, group, &ordinals, state, target, &mut report)?);
    }
    for index in groups.len()..target_groups {
        report.missing.push(format!("{PARAM_GROUPS_KEY}.{index}"));
    }

    for key in state.keys() {
        if !key.as_i64().is_some_and(|ordinal| listed.contains(&ordinal)) {
            report.unexpected.push(describe_key(key));
        }
    }

    // Everything is valid, commit.
    for (index, group) in staged.into_iter().enumerate() {
        target.set_hyperparameters(index, group.hyperparameters);
        for (param, state) in group.params.into_iter().enumerate() {
            target.set_param_state(index, param, state);
        }
    }
    log::debug!(
        "Applied optimizer state: {} params with state, {} without",
        report.applied.len(),
        report.missing.len()
    );

    Ok(report)
}

fn group_ordinals(index: usize, group: &DecodedValue) -> Result<Vec<i64>, MappingError> {
    let params = group
        .as_dict()
        .and_then(|group| group.get_str(PARAMS_KEY))
        .and_then(DecodedValue::as_sequence)
        .ok_or_else(|| MappingError::invalid(format!("param group {index} has no 'params' list")))?;
    params
        .iter()
        .map(|ordinal| match ordinal {
            DecodedValue::Int(ordinal) => Ok(*ordinal),
            other => Err(MappingError::invalid(format!(
                "param group {index} lists a {} as parameter",
                other.kind()
            ))),
        })
        .collect()
}

fn stage_group<T: OptimizerTarget + ?Sized>(
    index: usize,
    group: &DecodedValue,
    ordinals: &[i64],
    state: &Dict,
    target: &T,
    report: &mut ApplyReport,
) -> Result<StagedGroup, MappingError> {
    let shapes = target.param_shapes(index);
    if shapes.len() != ordinals.len() {
        return Err(MappingError::ParamCountMismatch {
            group: index,
            saved: ordinals.len(),
            target: shapes.len(),
        });
    }

    let mut hyperparameters = Hyperparameters::new();
    // `group_ordinals` already checked this is a dict.
    if let Some(group) = group.as_dict() {
        for (key, value) in group.iter() {
            let key = key.as_str().ok_or_else(|| {
                MappingError::invalid(format!("param group {index} has a {} key", key.kind()))
            })?;
            if key != PARAMS_KEY {
                hyperparameters.insert(key.to_string(), value.clone());
            }
        }
    }

    let mut params = Vec::with_capacity(ordinals.len());
    for (position, (ordinal, shape)) in ordinals.iter().zip(&shapes).enumerate() {
        let Some(saved) = state.get_int(*ordinal) else {
            report.missing.push(ordinal.to_string());
            params.push(ParamState::new());
            continue;
        };
        let saved = saved.as_dict().ok_or_else(|| {
            MappingError::invalid(format!("state of parameter {ordinal} is a {}", saved.kind()))
        })?;

        let mut param_state = ParamState::new();
        for (name, value) in saved.iter() {
            let name = name.as_str().ok_or_else(|| {
                MappingError::invalid(format!(
                    "state of parameter {ordinal} has a {} key",
                    name.kind()
                ))
            })?;
            check_buffer(index, position, *ordinal, name, value, shape)?;
            param_state.insert(name.to_string(), value.clone());
        }
        report.applied.push(ordinal.to_string());
        params.push(param_state);
    }

    Ok(StagedGroup {
        hyperparameters,
        params,
    })
}

/// Buffers must have the parameter's shape. 0-dim tensors are scalar state (`step`).
fn check_buffer(
    group: usize,
    position: usize,
    ordinal: i64,
    name: &str,
    value: &DecodedValue,
    shape: &[usize],
) -> Result<(), MappingError> {
    match value {
        DecodedValue::Tensor(tensor) if tensor.shape().is_empty() => Ok(()),
        DecodedValue::Tensor(tensor) if tensor.shape() != shape => {
            Err(MappingError::ShapeMismatch {
                param: format!("param_groups.{group}.params.{position} (state {ordinal}, {name})"),
                expected: shape.to_vec(),
                found: tensor.shape().to_vec(),
            })
        }
        DecodedValue::TensorRef(_) => Err(MappingError::invalid(format!(
            "state '{name}' of parameter {ordinal} is not materialized"
        ))),
        _ => Ok(()),
    }
}

fn describe_key(key: &DecodedValue) -> String {
    match key {
        DecodedValue::Int(value) => value.to_string(),
        DecodedValue::String(value) => value.clone(),
        other => format!("<{}>", other.kind()),
    }
}
