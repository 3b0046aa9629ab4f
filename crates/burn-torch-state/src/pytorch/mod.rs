//! PyTorch `torch.save` checkpoint support.
//!
//! Reading a checkpoint runs in three steps:
//!
//! 1. [`Archive`] indexes the zip container.
//! 2. [`pickle_reader::decode`] executes the `data.pkl` opcode stream against a closed
//!    registry of globals and yields a [`DecodedValue`] whose tensors are still
//!    [`DecodedValue::TensorRef`] descriptors.
//! 3. [`Materializer`] resolves every descriptor against the archive's storages.
//!
//! [`load_object_graph`] does all three. [`PytorchReader`] keeps the archive open and adds
//! state dict helpers.

pub mod archive;
pub mod materialize;
pub mod opcode;
pub mod pickle_reader;
pub mod registry;

#[cfg(test)]
pub(crate) mod tests;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use std::path::Path;

use bytes::Bytes;

pub use archive::{Archive, StorageSource};
pub use materialize::{Materializer, materialize};

use crate::error::{Error, Result};
use crate::tensor::Tensor;
use crate::value::DecodedValue;

/// Read a `torch.save` checkpoint and return its root object with every tensor materialized.
pub fn load_object_graph(path: impl AsRef<Path>) -> Result<DecodedValue> {
    PytorchReader::open(path)?.object_graph()
}

/// An open `torch.save` checkpoint.
#[derive(Debug, Clone)]
pub struct PytorchReader {
    archive: Archive,
}

impl PytorchReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Reading PyTorch checkpoint {}", path.display());
        Ok(Self {
            archive: Archive::open(path)?,
        })
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Result<Self> {
        Ok(Self {
            archive: Archive::from_bytes(data)?,
        })
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    /// Decode the object graph and materialize its tensors.
    pub fn object_graph(&self) -> Result<DecodedValue> {
        let pickle = self.archive.read_pickle()?;
        let mut root = pickle_reader::decode(&pickle)?;
        Materializer::new(&self.archive).materialize_all(&mut root)?;
        Ok(root)
    }

    /// Tensors of a state dict keyed by dotted path.
    ///
    /// With `top_level_key`, the state dict is looked up under that key of the root mapping,
    /// as in checkpoints saved as `{"model": model.state_dict(), ...}`. Nested mappings are
    /// flattened with `.`; entries that are not tensors are skipped.
    pub fn tensors(&self, top_level_key: Option<&str>) -> Result<BTreeMap<String, Tensor>> {
        let root = self.object_graph()?;
        let state = match top_level_key {
            Some(key) => root
                .as_dict()
                .and_then(|dict| dict.get_str(key))
                .ok_or_else(|| Error::UnsupportedFormat {
                    reason: format!("checkpoint has no top-level key '{key}'"),
                })?,
            None => &root,
        };

        let mut tensors = BTreeMap::new();
        flatten(state, String::new(), &mut tensors);
        Ok(tensors)
    }
}

fn flatten(value: &DecodedValue, path: String, out: &mut BTreeMap<String, Tensor>) {
    match value {
        DecodedValue::Tensor(tensor) => {
            out.insert(path, tensor.clone());
        }
        DecodedValue::Dict(dict) => {
            for (key, value) in dict.iter() {
                let key = match key {
                    DecodedValue::String(key) => key.clone(),
                    DecodedValue::Int(key) => key.to_string(),
                    other => {
                        log::trace!("Skipping entry with a {} key under '{path}'", other.kind());
                        continue;
                    }
                };
                let child = if path.is_empty() {
                    key
                } else {
                    format!("{path}.{key}")
                };
                flatten(value, child, out);
            }
        }
        other => log::trace!("Skipping {} at '{path}'", other.kind()),
    }
}
