//! Safetensors buffers for tests.


use alloc::collections::BTreeMap;

use crate::DType;

/// Assemble a file from a JSON header and a payload, without validation.
pub(crate) fn raw_file(header: serde_json::Value, payload: &[u8]) -> Vec<u8> {
    let header = serde_json::to_vec(&header).unwrap();
    let mut data = (header.len() as u64).to_le_bytes().to_vec();
    data.extend_from_slice(&header);
    data.extend_from_slice(payload);
    data
}

/// Writes tensors back to back, in insertion order.
#[derive(Default)]
pub(crate) struct SafetensorsWriter {
    tensors: Vec<(String, DType, Vec<usize>, Vec<u8>)>,
    metadata: BTreeMap<String, String>,
}

impl SafetensorsWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tensor(mut self, name: &str, dtype: DType, shape: &[usize], data: Vec<u8>) -> Self {
        self.tensors
            .push((name.to_string(), dtype, shape.to_vec(), data));
        self
    }

    pub fn f32(self, name: &str, shape: &[usize], values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.tensor(name, DType::F32, shape, data)
    }

    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut header = serde_json::Map::new();
        if !self.metadata.is_empty() {
            header.insert(
                "__metadata__".to_string(),
                serde_json::to_value(&self.metadata).unwrap(),
            );
        }
        let mut payload = Vec::new();
        for (name, dtype, shape, data) in self.tensors {
            let start = payload.len();
            payload.extend_from_slice(&data);
            header.insert(
                name,
                serde_json::json!({
                    "dtype": dtype.safetensors_tag(),
                    "shape": shape,
                    "data_offsets": [start, payload.len()],
                }),
            );
        }
        raw_file(serde_json::Value::Object(header), &payload)
    }
}
