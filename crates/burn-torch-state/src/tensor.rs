//! Materialized tensors.
//!
//! A [`Tensor`] is a contiguous, row-major byte buffer tagged with a dtype and a shape. The
//! buffer is a [`bytes::Bytes`], so tensors sliced out of an archive entry or a memory-mapped
//! safetensors file alias the loaded bytes instead of copying them.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use bytemuck::Pod;
use bytes::Bytes;
use half::{bf16, f16};

use crate::error::{Error, Result};

/// Supported data types for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DType {
    /// 64-bit floating point
    F64,
    /// 32-bit floating point
    F32,
    /// 16-bit floating point
    F16,
    /// Brain floating point
    BF16,
    /// 64-bit integer
    I64,
    /// 32-bit integer
    I32,
    /// 16-bit integer
    I16,
    /// 8-bit integer
    I8,
    /// 8-bit unsigned integer
    U8,
    /// Boolean, one byte per element
    Bool,
}

impl DType {
    /// Size in bytes of one element.
    pub const fn size(&self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }

    /// Whether the dtype is a floating point type.
    pub const fn is_float(&self) -> bool {
        matches!(self, DType::F64 | DType::F32 | DType::F16 | DType::BF16)
    }

    /// Parse a safetensors dtype tag (`"F32"`, `"BOOL"`, ...).
    pub fn from_safetensors(tag: &str) -> Option<Self> {
        Some(match tag {
            "F64" => DType::F64,
            "F32" => DType::F32,
            "F16" => DType::F16,
            "BF16" => DType::BF16,
            "I64" => DType::I64,
            "I32" => DType::I32,
            "I16" => DType::I16,
            "I8" => DType::I8,
            "U8" => DType::U8,
            "BOOL" => DType::Bool,
            _ => return None,
        })
    }

    /// The safetensors dtype tag.
    pub const fn safetensors_tag(&self) -> &'static str {
        match self {
            DType::F64 => "F64",
            DType::F32 => "F32",
            DType::F16 => "F16",
            DType::BF16 => "BF16",
            DType::I64 => "I64",
            DType::I32 => "I32",
            DType::I16 => "I16",
            DType::I8 => "I8",
            DType::U8 => "U8",
            DType::Bool => "BOOL",
        }
    }

    /// Map a legacy typed storage class name (`FloatStorage`, ...) to its dtype.
    pub fn from_storage_name(name: &str) -> Option<Self> {
        Some(match name {
            "DoubleStorage" => DType::F64,
            "FloatStorage" => DType::F32,
            "HalfStorage" => DType::F16,
            "BFloat16Storage" => DType::BF16,
            "LongStorage" => DType::I64,
            "IntStorage" => DType::I32,
            "ShortStorage" => DType::I16,
            "CharStorage" => DType::I8,
            "ByteStorage" => DType::U8,
            "BoolStorage" => DType::Bool,
            _ => return None,
        })
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F64 => write!(f, "f64"),
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::I64 => write!(f, "i64"),
            DType::I32 => write!(f, "i32"),
            DType::I16 => write!(f, "i16"),
            DType::I8 => write!(f, "i8"),
            DType::U8 => write!(f, "u8"),
            DType::Bool => write!(f, "bool"),
        }
    }
}

/// Row-major strides of a contiguous tensor with the given shape.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = alloc::vec![0; shape.len()];
    let mut acc = 1usize;
    for (stride, dim) in strides.iter_mut().zip(shape).rev() {
        *stride = acc;
        acc = acc.saturating_mul(*dim);
    }
    strides
}

/// A loaded tensor.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    bytes: Bytes,
    dtype: DType,
    shape: Vec<usize>,
    requires_grad: bool,
}

impl Tensor {
    /// Create a tensor from a contiguous little-endian byte buffer.
    ///
    /// Fails with [`Error::CorruptTensor`] when the buffer length does not match the shape.
    pub fn from_bytes(bytes: Bytes, shape: Vec<usize>, dtype: DType) -> Result<Self> {
        let expected = shape
            .iter()
            .try_fold(dtype.size(), |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| Error::corrupt_tensor(alloc::format!("shape {shape:?} overflows")))?;

        if bytes.len() != expected {
            return Err(Error::corrupt_tensor(alloc::format!(
                "{} bytes cannot hold a {dtype} tensor of shape {shape:?} ({expected} bytes)",
                bytes.len()
            )));
        }

        Ok(Self {
            bytes,
            dtype,
            shape,
            requires_grad: false,
        })
    }

    /// Create a tensor by copying typed elements.
    pub fn from_slice<E: Pod>(values: &[E], shape: Vec<usize>, dtype: DType) -> Result<Self> {
        if core::mem::size_of::<E>() != dtype.size() {
            return Err(Error::corrupt_tensor(alloc::format!(
                "element size {} does not match dtype {dtype}",
                core::mem::size_of::<E>()
            )));
        }
        let bytes = Bytes::copy_from_slice(bytemuck::cast_slice(values));
        Self::from_bytes(bytes, shape, dtype)
    }

    pub(crate) fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Dimensions, outermost first. Empty for a 0-dim (scalar) tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the saved tensor was tracking gradients.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// The raw little-endian bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// A cheap handle on the underlying buffer.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    /// Copy the elements out as `E`, which must have the size of the dtype.
    pub fn to_vec<E: Pod>(&self) -> Result<Vec<E>> {
        if core::mem::size_of::<E>() != self.dtype.size() {
            return Err(Error::corrupt_tensor(alloc::format!(
                "cannot read {} tensor as {}-byte elements",
                self.dtype,
                core::mem::size_of::<E>()
            )));
        }
        // The buffer may alias an arbitrarily aligned archive entry.
        Ok(bytemuck::pod_collect_to_vec(&self.bytes))
    }

    /// Convert every element to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        let bytes: &[u8] = &self.bytes;
        let size = self.dtype.size();
        bytes
            .chunks_exact(size)
            .map(|chunk| match self.dtype {
                DType::F64 => f64::from_le_bytes(to_array(chunk)),
                DType::F32 => f32::from_le_bytes(to_array(chunk)) as f64,
                DType::F16 => f16::from_le_bytes(to_array(chunk)).to_f64(),
                DType::BF16 => bf16::from_le_bytes(to_array(chunk)).to_f64(),
                DType::I64 => i64::from_le_bytes(to_array(chunk)) as f64,
                DType::I32 => i32::from_le_bytes(to_array(chunk)) as f64,
                DType::I16 => i16::from_le_bytes(to_array(chunk)) as f64,
                DType::I8 => chunk[0] as i8 as f64,
                DType::U8 => chunk[0] as f64,
                DType::Bool => (chunk[0] != 0) as u8 as f64,
            })
            .collect()
    }

    /// The value of a single-element tensor, converted to `f64`.
    pub fn scalar(&self) -> Option<f64> {
        match self.num_elements() {
            1 => self.to_f64_vec().first().copied(),
            _ => None,
        }
    }
}

fn to_array<const N: usize>(chunk: &[u8]) -> [u8; N] {
    let mut array = [0u8; N];
    array.copy_from_slice(chunk);
    array
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("requires_grad", &self.requires_grad)
            .field("num_bytes", &self.bytes.len())
            .finish()
    }
}

/// Describe a tensor in one line, e.g. `f32[2, 3]`.
pub fn describe(tensor: &Tensor) -> String {
    alloc::format!("{}{:?}", tensor.dtype, tensor.shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn strides_are_row_major() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());
        assert_eq!(contiguous_strides(&[5]), vec![1]);
    }

    #[test]
    fn from_bytes_checks_length() {
        let bytes = Bytes::from(vec![0u8; 12]);
        assert!(Tensor::from_bytes(bytes.clone(), vec![3], DType::F32).is_ok());
        assert!(matches!(
            Tensor::from_bytes(bytes, vec![2, 2], DType::F32),
            Err(Error::CorruptTensor { .. })
        ));
    }

    #[test]
    fn typed_reads() {
        let tensor = Tensor::from_slice(&[1.5f32, -2.0, 3.25], vec![3], DType::F32).unwrap();
        assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![1.5, -2.0, 3.25]);
        assert_eq!(tensor.to_f64_vec(), vec![1.5, -2.0, 3.25]);
        assert!(tensor.to_vec::<f64>().is_err());
        assert_eq!(tensor.scalar(), None);
    }

    #[test]
    fn half_precision_to_f64() {
        let values = [f16::from_f32(0.5), f16::from_f32(-4.0)];
        let tensor = Tensor::from_slice(&values, vec![2], DType::F16).unwrap();
        assert_eq!(tensor.to_f64_vec(), vec![0.5, -4.0]);

        let values = [bf16::from_f32(2.0)];
        let tensor = Tensor::from_slice(&values, vec![], DType::BF16).unwrap();
        assert_eq!(tensor.scalar(), Some(2.0));
    }

    #[test]
    fn storage_names() {
        assert_eq!(DType::from_storage_name("LongStorage"), Some(DType::I64));
        assert_eq!(DType::from_storage_name("ByteStorage"), Some(DType::U8));
        assert_eq!(DType::from_storage_name("QInt8Storage"), None);
    }

    #[test]
    fn safetensors_tags() {
        for dtype in [DType::F64, DType::BF16, DType::I16, DType::Bool] {
            assert_eq!(DType::from_safetensors(dtype.safetensors_tag()), Some(dtype));
        }
        assert_eq!(DType::from_safetensors("F8_E4M3"), None);
    }
}
