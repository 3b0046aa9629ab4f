//! SafeTensors container support.
//!
//! [SafeTensors](https://github.com/huggingface/safetensors) is a flat, tensor-only format:
//!
//! ```text
//! ┌───────────────┬────────────────────────┬──────────────────────────────┐
//! │ header length │ JSON header            │ payload                      │
//! │ u64, LE       │ header length bytes    │ concatenated tensor bytes    │
//! └───────────────┴────────────────────────┴──────────────────────────────┘
//! ```
//!
//! The header maps each tensor name to `{"dtype", "shape", "data_offsets": [start, end]}`,
//! with offsets relative to the start of the payload. An optional `__metadata__` entry holds
//! string metadata and is not a tensor.
//!
//! Unlike a pickle checkpoint, loading a safetensors file never executes anything: the header
//! is validated once (see [`SafetensorsHeader::new`]) and tensors are slices of the file
//! buffer, memory mapped when the `memmap` feature is enabled.
//!
//! ```rust,no_run
//! use burn_torch_state::SafetensorsFile;
//!
//! let file = SafetensorsFile::open("model.safetensors")?;
//! let weights = file.load_only(["lin1.weight"])?;
//! # Ok::<(), burn_torch_state::Error>(())
//! ```

mod header;

#[cfg(test)]
pub(crate) mod tests;

use alloc::collections::BTreeMap;
use alloc::string::String;
use std::path::Path;

use bytes::Bytes;

pub use header::{MAX_HEADER_SIZE, METADATA_KEY, SafetensorsHeader, TensorInfo};

use crate::error::Result;
use crate::file::read_file;
use crate::tensor::Tensor;

/// Read every tensor of a safetensors file.
pub fn load_tensor_container(path: impl AsRef<Path>) -> Result<BTreeMap<String, Tensor>> {
    SafetensorsFile::open(path)?.load_all()
}

/// A safetensors buffer with a validated header.
#[derive(Debug, Clone)]
pub struct SafetensorsFile {
    data: Bytes,
    header: SafetensorsHeader,
    payload_start: usize,
}

impl SafetensorsFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Reading safetensors file {}", path.display());
        Self::from_bytes(read_file(path)?)
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let (header, payload_start) = SafetensorsHeader::read(&data)?;
        Ok(Self {
            data,
            header,
            payload_start,
        })
    }

    pub fn header(&self) -> &SafetensorsHeader {
        &self.header
    }

    /// Tensor names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.header.tensors().iter().map(|info| info.name.as_str())
    }

    pub fn metadata(&self) -> Option<&BTreeMap<String, String>> {
        self.header.metadata()
    }

    /// Load one tensor, or `None` if the file has no tensor of that name.
    pub fn tensor(&self, name: &str) -> Result<Option<Tensor>> {
        self.header
            .get(name)
            .map(|info| self.load(info))
            .transpose()
    }

    pub fn load_all(&self) -> Result<BTreeMap<String, Tensor>> {
        self.header
            .tensors()
            .iter()
            .map(|info| Ok((info.name.clone(), self.load(info)?)))
            .collect()
    }

    /// Load only the named tensors. Names the file does not contain are ignored.
    pub fn load_only<S: AsRef<str>>(
        &self,
        names: impl IntoIterator<Item = S>,
    ) -> Result<BTreeMap<String, Tensor>> {
        let mut tensors = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            match self.header.get(name) {
                Some(info) => {
                    tensors.insert(info.name.clone(), self.load(info)?);
                }
                None => log::debug!("Tensor '{name}' not in safetensors file, skipping"),
            }
        }
        Ok(tensors)
    }

    fn load(&self, info: &TensorInfo) -> Result<Tensor> {
        let start = self.payload_start + info.start;
        let end = self.payload_start + info.end;
        Tensor::from_bytes(self.data.slice(start..end), info.shape.clone(), info.dtype)
    }
}
