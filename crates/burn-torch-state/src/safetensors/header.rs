use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use byteorder::{ByteOrder, LittleEndian};
use derive_new::new;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::tensor::DType;

/// Reserved header key for free-form metadata. Only its string entries are kept.
pub const METADATA_KEY: &str = "__metadata__";

/// Headers larger than this are rejected before parsing.
pub const MAX_HEADER_SIZE: usize = 100_000_000;

/// Size of the little-endian header length prefix.
pub const HEADER_LENGTH_SIZE: usize = 8;

/// One header entry.
#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Start of the tensor bytes, relative to the payload.
    pub start: usize,
    /// End of the tensor bytes (exclusive), relative to the payload.
    pub end: usize,
}

impl TensorInfo {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Deserialize)]
struct RawEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: (usize, usize),
}

/// The parsed and validated JSON header of a safetensors buffer.
///
/// Construction guarantees that every span lies within the payload, that spans do not
/// overlap, and that each span holds exactly `numel * dtype.size()` bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetensorsHeader {
    tensors: Vec<TensorInfo>,
    metadata: Option<BTreeMap<String, String>>,
}

impl SafetensorsHeader {
    /// Validate entries against a payload of `payload_len` bytes.
    pub fn new(
        mut tensors: Vec<TensorInfo>,
        metadata: Option<BTreeMap<String, String>>,
        payload_len: usize,
    ) -> Result<Self> {
        for info in &tensors {
            if info.start > info.end {
                return Err(out_of_range(info, info.end));
            }
            if info.end > payload_len {
                return Err(out_of_range(info, payload_len));
            }
            let expected = info
                .shape
                .iter()
                .try_fold(info.dtype.size(), |acc, dim| acc.checked_mul(*dim));
            if expected != Some(info.end - info.start) {
                return Err(Error::corrupt_tensor(format!(
                    "'{}' spans {} bytes but a {} tensor of shape {:?} needs {}",
                    info.name,
                    info.end - info.start,
                    info.dtype,
                    info.shape,
                    expected.map_or("more than usize::MAX".to_string(), |n| n.to_string()),
                )));
            }
        }

        // Files are written in whatever order the producer chose; check in byte order.
        tensors.sort_by(|a, b| (a.start, a.end).cmp(&(b.start, b.end)));
        let mut previous_end = 0;
        for info in &tensors {
            if info.start < previous_end {
                return Err(out_of_range(info, previous_end));
            }
            previous_end = info.end;
        }

        tensors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { tensors, metadata })
    }

    /// Parse a whole safetensors buffer and return the header with the offset of the payload.
    pub fn read(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < HEADER_LENGTH_SIZE {
            return Err(parse_error(format!(
                "buffer of {} bytes is too short for the header length",
                data.len()
            )));
        }
        let header_len = LittleEndian::read_u64(&data[..HEADER_LENGTH_SIZE]);
        let header_len = usize::try_from(header_len)
            .ok()
            .filter(|len| *len <= MAX_HEADER_SIZE)
            .ok_or_else(|| {
                parse_error(format!(
                    "header length {header_len} exceeds the limit of {MAX_HEADER_SIZE} bytes"
                ))
            })?;
        let payload_start = HEADER_LENGTH_SIZE + header_len;
        if payload_start > data.len() {
            return Err(parse_error(format!(
                "header length {header_len} exceeds the buffer size {}",
                data.len()
            )));
        }

        let header = Self::parse(
            &data[HEADER_LENGTH_SIZE..payload_start],
            data.len() - payload_start,
        )?;
        Ok((header, payload_start))
    }

    /// Parse the JSON header text.
    pub fn parse(json: &[u8], payload_len: usize) -> Result<Self> {
        let raw: BTreeMap<String, serde_json::Value> =
            serde_json::from_slice(json).map_err(|e| parse_error(e.to_string()))?;

        let mut metadata = None;
        let mut tensors = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            if name == METADATA_KEY {
                metadata = string_metadata(value);
                continue;
            }
            let entry: RawEntry = serde_json::from_value(value)
                .map_err(|e| parse_error(format!("'{name}': {e}")))?;
            let dtype = DType::from_safetensors(&entry.dtype).ok_or_else(|| {
                parse_error(format!("'{name}': unsupported dtype '{}'", entry.dtype))
            })?;
            let (start, end) = entry.data_offsets;
            tensors.push(TensorInfo::new(name, dtype, entry.shape, start, end));
        }

        log::debug!("Parsed safetensors header with {} tensors", tensors.len());
        Self::new(tensors, metadata, payload_len)
    }

    /// Entries sorted by name.
    pub fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors
            .binary_search_by(|info| info.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.tensors[i])
    }

    pub fn metadata(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.as_ref()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// String entries of the metadata object. Anything else in it is free-form and dropped.
fn string_metadata(value: serde_json::Value) -> Option<BTreeMap<String, String>> {
    let serde_json::Value::Object(entries) = value else {
        log::debug!("Ignoring {METADATA_KEY}: not an object");
        return None;
    };
    let mut metadata = BTreeMap::new();
    for (key, value) in entries {
        match value {
            serde_json::Value::String(text) => {
                metadata.insert(key, text);
            }
            other => log::trace!("Ignoring non-string {METADATA_KEY} entry '{key}': {other}"),
        }
    }
    Some(metadata)
}

fn parse_error(reason: String) -> Error {
    Error::HeaderParseError { reason }
}

fn out_of_range(info: &TensorInfo, limit: usize) -> Error {
    Error::OffsetOutOfRange {
        name: info.name.clone(),
        start: info.start,
        end: info.end,
        limit,
    }
}
