#![cfg_attr(docsrs, feature(doc_cfg))]

//! Load PyTorch checkpoints without PyTorch.
//!
//! `burn-torch-state` reads the two formats PyTorch checkpoints come in and applies the result
//! to live structures:
//!
//! - `torch.save` archives: a zip container whose `data.pkl` opcode stream is executed by a
//!   small virtual machine that only knows tensors, storages and plain containers
//!   ([`load_object_graph`], [`PytorchReader`]).
//! - safetensors files: a JSON header followed by raw tensor bytes
//!   ([`load_tensor_container`], [`SafetensorsFile`]).
//! - `save_pretrained` directories, sharded or not ([`load_checkpoint`]).
//!
//! Decoded optimizer and module states are applied with [`apply_optimizer_state`] and
//! [`apply_module_state`] onto anything implementing [`OptimizerTarget`] or [`ModuleTarget`].
//!
//! ```rust,no_run
//! use burn_torch_state::{DecodedValue, load_checkpoint};
//!
//! let weights = load_checkpoint("checkpoints/run-3", None)?;
//! let state = DecodedValue::from(weights);
//! # Ok::<(), burn_torch_state::Error>(())
//! ```

extern crate alloc;

mod checkpoint;
mod error;
mod file;
mod mapper;
mod tensor;
mod value;

pub mod pytorch;
pub mod safetensors;

pub use checkpoint::{CHECKPOINT_NAMES, load_checkpoint};
pub use error::{Error, MappingError, Result};
pub use mapper::{
    ApplyReport, GroupCountPolicy, Hyperparameters, ModuleLoadOptions, ModuleTarget,
    OptimizerLoadOptions, OptimizerTarget, ParamState, TensorSlot, UnmatchedPolicy,
    apply_module_state, apply_module_state_with, apply_optimizer_state,
    apply_optimizer_state_with,
};
pub use pytorch::{PytorchReader, load_object_graph};
pub use safetensors::{SafetensorsFile, load_tensor_container};
pub use tensor::{DType, Tensor, contiguous_strides, describe};
pub use value::{DecodedValue, Dict, GlobalRef, StorageRef, TensorDescriptor, UnhashableKey};
