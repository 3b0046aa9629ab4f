//! In-memory optimizers and modules to apply state onto.


use alloc::collections::BTreeMap;

use super::{Hyperparameters, ModuleTarget, OptimizerTarget, ParamState, TensorSlot};
use crate::tensor::{DType, Tensor};
use crate::value::{DecodedValue, Dict};

pub const INITIAL_LR: f64 = 0.99;

pub struct FakeGroup {
    pub hyperparameters: Hyperparameters,
    pub shapes: Vec<Vec<usize>>,
    pub state: Vec<ParamState>,
}

/// Every group starts with `lr = 0.99` and an `initial` marker in each parameter state.
pub struct FakeOptimizer {
    pub groups: Vec<FakeGroup>,
}

impl FakeOptimizer {
    pub fn new(groups: &[&[&[usize]]]) -> Self {
        let groups = groups
            .iter()
            .map(|shapes| FakeGroup {
                hyperparameters: [("lr".to_string(), DecodedValue::Float(INITIAL_LR))].into(),
                shapes: shapes.iter().map(|shape| shape.to_vec()).collect(),
                state: shapes
                    .iter()
                    .map(|_| [("initial".to_string(), DecodedValue::Bool(true))].into())
                    .collect(),
            })
            .collect();
        Self { groups }
    }

    pub fn hyperparameter(&self, group: usize, name: &str) -> &DecodedValue {
        &self.groups[group].hyperparameters[name]
    }

    pub fn lr(&self, group: usize) -> f64 {
        self.hyperparameter(group, "lr").as_f64().unwrap()
    }

    pub fn is_untouched(&self) -> bool {
        self.groups.iter().all(|group| {
            group.hyperparameters.len() == 1
                && group.hyperparameters["lr"] == DecodedValue::Float(INITIAL_LR)
                && group.state.iter().all(|state| state.contains_key("initial"))
        })
    }
}

impl OptimizerTarget for FakeOptimizer {
    fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn param_shapes(&self, group: usize) -> Vec<Vec<usize>> {
        self.groups[group].shapes.clone()
    }

    fn set_hyperparameters(&mut self, group: usize, hyperparameters: Hyperparameters) {
        self.groups[group].hyperparameters = hyperparameters;
    }

    fn set_param_state(&mut self, group: usize, param: usize, state: ParamState) {
        self.groups[group].state[param] = state;
    }
}

/// Two bias-free linear layers: `lin1` maps 5 features to 1, `lin2` maps 1 to 2.
#[derive(Default)]
pub struct TwoLayer {
    pub loaded: BTreeMap<String, Tensor>,
}

impl TwoLayer {
    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        let hidden = matvec(&self.loaded["lin1.weight"], input);
        matvec(&self.loaded["lin2.weight"], &hidden)
    }
}

impl ModuleTarget for TwoLayer {
    fn slots(&self) -> Vec<TensorSlot> {
        vec![
            TensorSlot::new("lin1.weight".into(), vec![1, 5], DType::F32),
            TensorSlot::new("lin2.weight".into(), vec![2, 1], DType::F32),
        ]
    }

    fn load_tensor(&mut self, name: &str, tensor: Tensor) {
        self.loaded.insert(name.to_string(), tensor);
    }
}

/// `weight @ input` for a `[out, in]` weight.
pub fn matvec(weight: &Tensor, input: &[f32]) -> Vec<f32> {
    let columns = weight.shape()[1];
    weight
        .to_vec::<f32>()
        .unwrap()
        .chunks(columns)
        .map(|row| row.iter().zip(input).map(|(w, x)| w * x).sum())
        .collect()
}

pub fn f32_tensor(shape: &[usize], values: &[f32]) -> DecodedValue {
    Tensor::from_slice(values, shape.to_vec(), DType::F32)
        .unwrap()
        .into()
}

pub fn dict<K: Into<DecodedValue>>(
    entries: impl IntoIterator<Item = (K, DecodedValue)>,
) -> DecodedValue {
    let mut dict = Dict::new();
    for (key, value) in entries {
        dict.insert(key.into(), value);
    }
    DecodedValue::Dict(dict)
}

/// A param group as `torch.optim` saves it.
pub fn group(lr: f64, params: &[i64]) -> DecodedValue {
    dict([
        ("lr", DecodedValue::Float(lr)),
        ("weight_decay", DecodedValue::Float(0.0)),
        (
            "params",
            DecodedValue::List(params.iter().map(|p| DecodedValue::Int(*p)).collect()),
        ),
    ])
}

pub fn optimizer_state(state: Vec<(i64, DecodedValue)>, groups: Vec<DecodedValue>) -> DecodedValue {
    dict([
        ("state", dict(state)),
        ("param_groups", DecodedValue::List(groups)),
    ])
}

/// Adam buffers for a parameter of `shape`.
pub fn adam_state(step: f32, shape: &[usize]) -> DecodedValue {
    let numel = shape.iter().product();
    dict([
        ("step", f32_tensor(&[], &[step])),
        ("exp_avg", f32_tensor(shape, &vec![0.5; numel])),
        ("exp_avg_sq", f32_tensor(shape, &vec![0.25; numel])),
    ])
}
