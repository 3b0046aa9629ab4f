//! Turns [`TensorDescriptor`]s into [`Tensor`]s.
//!
//! A descriptor is a strided view over a storage. Before any byte is read, the largest
//! element offset the view can address, `storage_offset + Σ (shape[i] - 1) * stride[i]`, is
//! checked against the storage length. Row-major views are then sliced out of the storage
//! buffer; any other layout is gathered into a fresh contiguous buffer.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use bytes::Bytes;
use hashbrown::HashMap;

use super::archive::StorageSource;
use crate::error::{Error, Result};
use crate::tensor::Tensor;
use crate::value::{DecodedValue, TensorDescriptor};

/// Materialize a single descriptor.
pub fn materialize(descriptor: &TensorDescriptor, source: &impl StorageSource) -> Result<Tensor> {
    let storage = source.storage(&descriptor.storage.key)?;
    view(descriptor, storage)
}

/// Materializes descriptors against one source, reading each storage once.
pub struct Materializer<'s, S> {
    source: &'s S,
    storages: HashMap<String, Bytes>,
}

impl<'s, S: StorageSource> Materializer<'s, S> {
    pub fn new(source: &'s S) -> Self {
        Self {
            source,
            storages: HashMap::new(),
        }
    }

    pub fn materialize(&mut self, descriptor: &TensorDescriptor) -> Result<Tensor> {
        let key = &descriptor.storage.key;
        let storage = match self.storages.get(key) {
            Some(storage) => storage.clone(),
            None => {
                let storage = self.source.storage(key)?;
                self.storages.insert(key.clone(), storage.clone());
                storage
            }
        };
        view(descriptor, storage)
    }

    /// Replace every [`DecodedValue::TensorRef`] in `value` with its tensor and return how many
    /// were replaced.
    pub fn materialize_all(&mut self, value: &mut DecodedValue) -> Result<usize> {
        let mut count = 0;
        value.visit_mut(&mut |node| {
            if let DecodedValue::TensorRef(descriptor) = node {
                let tensor = self.materialize(descriptor)?;
                *node = DecodedValue::Tensor(tensor);
                count += 1;
            }
            Ok::<(), Error>(())
        })?;
        log::debug!(
            "Materialized {count} tensors from {} storages",
            self.storages.len()
        );
        Ok(count)
    }
}

fn corrupt(descriptor: &TensorDescriptor, reason: String) -> Error {
    Error::corrupt_tensor(format!("storage '{}': {reason}", descriptor.storage.key))
}

fn view(descriptor: &TensorDescriptor, storage: Bytes) -> Result<Tensor> {
    let TensorDescriptor {
        dtype,
        shape,
        stride,
        storage_offset,
        ..
    } = descriptor;
    let size = dtype.size();

    if storage.len() % size != 0 {
        return Err(corrupt(
            descriptor,
            format!("{} bytes is not a whole number of {dtype} elements", storage.len()),
        ));
    }
    let available = storage.len() / size;
    let recorded = descriptor.storage.num_elements;
    if recorded > available {
        return Err(corrupt(
            descriptor,
            format!("{recorded} elements recorded but only {available} stored"),
        ));
    }

    if stride.len() != shape.len() {
        return Err(corrupt(
            descriptor,
            format!("stride {stride:?} does not match shape {shape:?}"),
        ));
    }
    let stride = stride
        .iter()
        .map(|s| usize::try_from(*s))
        .collect::<core::result::Result<Vec<_>, _>>()
        .map_err(|_| corrupt(descriptor, format!("negative stride in {stride:?}")))?;

    let num_elements = shape
        .iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
        .ok_or_else(|| corrupt(descriptor, format!("shape {shape:?} overflows")))?;
    if num_elements == 0 {
        return Ok(Tensor::from_bytes(Bytes::new(), shape.clone(), *dtype)?
            .with_requires_grad(descriptor.requires_grad));
    }

    let max_offset = shape
        .iter()
        .zip(&stride)
        .try_fold(*storage_offset, |acc, (dim, stride)| {
            (dim - 1)
                .checked_mul(*stride)
                .and_then(|extent| acc.checked_add(extent))
        });
    match max_offset {
        Some(max_offset) if max_offset < recorded => {}
        _ => {
            return Err(Error::CorruptTensor {
                reason: format!(
                    "storage '{}': view with offset {storage_offset}, shape {shape:?} and stride \
                     {stride:?} reads past the {recorded} elements of the storage",
                    descriptor.storage.key
                ),
                index: Some(shape.iter().map(|dim| dim - 1).collect()),
            });
        }
    }

    let bytes = if is_contiguous(shape, &stride) {
        let start = storage_offset * size;
        storage.slice(start..start + num_elements * size)
    } else {
        Bytes::from(gather(&storage, shape, &stride, *storage_offset, size, num_elements))
    };

    Ok(Tensor::from_bytes(bytes, shape.clone(), *dtype)?
        .with_requires_grad(descriptor.requires_grad))
}

/// Row-major layout, ignoring the stride of size-1 dimensions.
fn is_contiguous(shape: &[usize], stride: &[usize]) -> bool {
    let mut expected = 1;
    for (dim, stride) in shape.iter().zip(stride).rev() {
        if *dim != 1 && *stride != expected {
            return false;
        }
        expected *= dim;
    }
    true
}

/// Copy a strided view element by element. Offsets must have been bounds checked.
fn gather(
    storage: &[u8],
    shape: &[usize],
    stride: &[usize],
    storage_offset: usize,
    size: usize,
    num_elements: usize,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(num_elements * size);
    let mut index = alloc::vec![0usize; shape.len()];
    let mut offset = storage_offset;

    for _ in 0..num_elements {
        let start = offset * size;
        out.extend_from_slice(&storage[start..start + size]);

        for dim in (0..shape.len()).rev() {
            index[dim] += 1;
            offset += stride[dim];
            if index[dim] < shape[dim] {
                break;
            }
            offset -= stride[dim] * shape[dim];
            index[dim] = 0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;
    use crate::value::StorageRef;
    use alloc::collections::BTreeMap;
    use alloc::string::ToString;
    use alloc::vec;

    fn f32_storage(values: &[f32]) -> BTreeMap<String, Bytes> {
        let mut storages = BTreeMap::new();
        storages.insert(
            "0".to_string(),
            Bytes::copy_from_slice(bytemuck::cast_slice(values)),
        );
        storages
    }

    fn descriptor(
        numel: usize,
        shape: Vec<usize>,
        stride: Vec<i64>,
        offset: usize,
    ) -> TensorDescriptor {
        TensorDescriptor::new(
            StorageRef::new("0".into(), DType::F32, "cpu".into(), numel),
            DType::F32,
            shape,
            stride,
            offset,
            false,
        )
    }

    #[test]
    fn contiguous_view_aliases_storage() {
        let storages = f32_storage(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let tensor = materialize(&descriptor(6, vec![2, 2], vec![2, 1], 2), &storages).unwrap();

        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);

        let base = storages["0"].as_ptr() as usize;
        assert_eq!(tensor.as_bytes().as_ptr() as usize, base + 8);
    }

    #[test]
    fn transposed_view_is_gathered() {
        // [[0, 1, 2], [3, 4, 5]] viewed as its transpose.
        let storages = f32_storage(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let tensor = materialize(&descriptor(6, vec![3, 2], vec![1, 3], 0), &storages).unwrap();

        assert_eq!(
            tensor.to_vec::<f32>().unwrap(),
            vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]
        );
    }

    #[test]
    fn broadcast_view_repeats_elements() {
        let storages = f32_storage(&[7.0, 8.0]);
        let tensor = materialize(&descriptor(2, vec![3, 2], vec![0, 1], 0), &storages).unwrap();

        assert_eq!(
            tensor.to_vec::<f32>().unwrap(),
            vec![7.0, 8.0, 7.0, 8.0, 7.0, 8.0]
        );
    }

    #[test]
    fn scalar_and_empty_views() {
        let storages = f32_storage(&[1.0, 2.5]);
        let scalar = materialize(&descriptor(2, vec![], vec![], 1), &storages).unwrap();
        assert_eq!(scalar.scalar(), Some(2.5));

        let empty = materialize(&descriptor(2, vec![0, 4], vec![4, 1], 0), &storages).unwrap();
        assert_eq!(empty.num_elements(), 0);
        assert_eq!(empty.shape(), &[0, 4]);
    }

    #[test]
    fn corrupted_stride_is_rejected() {
        let storages = f32_storage(&[0.0; 6]);
        let error = materialize(&descriptor(6, vec![2, 3], vec![4, 1], 0), &storages).unwrap_err();

        match error {
            Error::CorruptTensor { index, .. } => assert_eq!(index, Some(vec![1, 2])),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn offset_past_storage_is_rejected() {
        let storages = f32_storage(&[0.0; 4]);
        let result = materialize(&descriptor(4, vec![2], vec![1], 3), &storages);
        assert!(matches!(result, Err(Error::CorruptTensor { .. })));
    }

    #[test]
    fn negative_stride_is_rejected() {
        let storages = f32_storage(&[0.0; 4]);
        let result = materialize(&descriptor(4, vec![2], vec![-1], 1), &storages);
        assert!(matches!(result, Err(Error::CorruptTensor { .. })));
    }

    #[test]
    fn short_storage_is_rejected() {
        let storages = f32_storage(&[0.0; 3]);
        let result = materialize(&descriptor(4, vec![4], vec![1], 0), &storages);
        assert!(matches!(result, Err(Error::CorruptTensor { .. })));

        let mut ragged = BTreeMap::new();
        ragged.insert("0".to_string(), Bytes::from(vec![0u8; 7]));
        let result = materialize(&descriptor(1, vec![1], vec![1], 0), &ragged);
        assert!(matches!(result, Err(Error::CorruptTensor { .. })));
    }

    #[test]
    fn missing_storage_is_reported() {
        let storages = BTreeMap::new();
        let result = materialize(&descriptor(1, vec![1], vec![1], 0), &storages);
        assert!(matches!(result, Err(Error::StorageNotFound { .. })));
    }

    #[test]
    fn shared_storage_is_read_once() {
        let storages = f32_storage(&[1.0, 2.0, 3.0, 4.0]);
        let mut value = DecodedValue::List(vec![
            DecodedValue::TensorRef(descriptor(4, vec![2], vec![1], 0)),
            DecodedValue::TensorRef(descriptor(4, vec![2], vec![1], 2)),
        ]);

        let mut materializer = Materializer::new(&storages);
        assert_eq!(materializer.materialize_all(&mut value).unwrap(), 2);
        assert_eq!(materializer.storages.len(), 1);

        let items = value.as_sequence().unwrap();
        assert_eq!(items[1].as_tensor().unwrap().to_vec::<f32>().unwrap(), vec![3.0, 4.0]);
    }
}
