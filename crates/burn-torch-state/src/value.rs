//! The decoded object graph.
//!
//! [`DecodedValue`] is the owned tree produced once a pickle stream has been fully executed.
//! Aliases inside the stream (memo references) are expanded, so two branches that referenced
//! the same object hold equal copies and aliasing identity is not preserved: mutating one copy
//! does not affect the other. Tensor payloads are [`bytes::Bytes`] handles and share their
//! buffer.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use derive_new::new;
use hashbrown::HashMap;

use crate::tensor::{DType, Tensor};

/// A decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    /// Python `None`.
    None,
    /// A boolean.
    Bool(bool),
    /// An integer that fits in 64 bits.
    Int(i64),
    /// A double precision float.
    Float(f64),
    /// A unicode string.
    String(String),
    /// A byte string.
    Bytes(Vec<u8>),
    /// An immutable sequence.
    Tuple(Vec<DecodedValue>),
    /// A mutable sequence. Sets are decoded as lists.
    List(Vec<DecodedValue>),
    /// An insertion-ordered mapping.
    Dict(Dict),
    /// A reference to a registered global that was never called.
    Global(GlobalRef),
    /// A storage placeholder.
    PersistentId(StorageRef),
    /// A tensor whose storage has not been resolved yet.
    TensorRef(TensorDescriptor),
    /// A materialized tensor.
    Tensor(Tensor),
}

impl DecodedValue {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodedValue::None => "none",
            DecodedValue::Bool(_) => "bool",
            DecodedValue::Int(_) => "int",
            DecodedValue::Float(_) => "float",
            DecodedValue::String(_) => "string",
            DecodedValue::Bytes(_) => "bytes",
            DecodedValue::Tuple(_) => "tuple",
            DecodedValue::List(_) => "list",
            DecodedValue::Dict(_) => "dict",
            DecodedValue::Global(_) => "global",
            DecodedValue::PersistentId(_) => "persistent id",
            DecodedValue::TensorRef(_) => "unresolved tensor",
            DecodedValue::Tensor(_) => "tensor",
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            DecodedValue::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DecodedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DecodedValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DecodedValue::Int(i) => Some(*i),
            DecodedValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Numeric value of an int, float or bool.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DecodedValue::Float(f) => Some(*f),
            DecodedValue::Int(i) => Some(*i as f64),
            DecodedValue::Bool(b) => Some(*b as u8 as f64),
            _ => None,
        }
    }

    /// Items of a tuple or a list.
    pub fn as_sequence(&self) -> Option<&[DecodedValue]> {
        match self {
            DecodedValue::Tuple(items) | DecodedValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            DecodedValue::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn into_tensor(self) -> Option<Tensor> {
        match self {
            DecodedValue::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<Dict> {
        match self {
            DecodedValue::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    /// Visit every value of the tree, depth first, parents before children.
    pub fn visit_mut<E>(
        &mut self,
        visitor: &mut impl FnMut(&mut DecodedValue) -> Result<(), E>,
    ) -> Result<(), E> {
        visitor(self)?;
        match self {
            DecodedValue::Tuple(items) | DecodedValue::List(items) => {
                for item in items {
                    item.visit_mut(visitor)?;
                }
            }
            DecodedValue::Dict(dict) => {
                for value in dict.values_mut() {
                    value.visit_mut(visitor)?;
                }
                for (_, value) in dict.attributes.iter_mut() {
                    value.visit_mut(visitor)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl From<Tensor> for DecodedValue {
    fn from(tensor: Tensor) -> Self {
        DecodedValue::Tensor(tensor)
    }
}

impl From<&str> for DecodedValue {
    fn from(value: &str) -> Self {
        DecodedValue::String(value.to_string())
    }
}

impl From<i64> for DecodedValue {
    fn from(value: i64) -> Self {
        DecodedValue::Int(value)
    }
}

impl From<BTreeMap<String, Tensor>> for DecodedValue {
    fn from(tensors: BTreeMap<String, Tensor>) -> Self {
        let mut dict = Dict::new();
        for (name, tensor) in tensors {
            dict.insert(DecodedValue::String(name), DecodedValue::Tensor(tensor));
        }
        DecodedValue::Dict(dict)
    }
}

/// Hashable projection of the values that may be used as mapping keys.
///
/// Numbers that compare equal hash to the same key: `True`, `1` and `1.0` are one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    None,
    Int(i64),
    Float(u64),
    String(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Key>),
}

impl Key {
    fn of(value: &DecodedValue) -> Option<Self> {
        Some(match value {
            DecodedValue::None => Key::None,
            DecodedValue::Bool(b) => Key::Int(*b as i64),
            DecodedValue::Int(i) => Key::Int(*i),
            DecodedValue::Float(f) if fits_i64(*f) => Key::Int(*f as i64),
            DecodedValue::Float(f) => Key::Float(f.to_bits()),
            DecodedValue::String(s) => Key::String(s.clone()),
            DecodedValue::Bytes(b) => Key::Bytes(b.clone()),
            DecodedValue::Tuple(items) => {
                Key::Tuple(items.iter().map(Key::of).collect::<Option<Vec<_>>>()?)
            }
            _ => return None,
        })
    }
}

/// Whether `value` is integral and in `[-2^63, 2^63)`.
fn fits_i64(value: f64) -> bool {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    value.fract() == 0.0 && (-TWO_POW_63..TWO_POW_63).contains(&value)
}

/// Error returned when inserting a key that cannot be hashed (a list, a dict, a tensor...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhashableKey(pub &'static str);

impl fmt::Display for UnhashableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unhashable mapping key of type {}", self.0)
    }
}

/// An insertion-ordered mapping with unique keys.
///
/// Besides its items, a mapping can carry instance attributes set by a BUILD opcode, such as
/// the `_metadata` that `state_dict()` attaches to its `OrderedDict`. Attributes never show up
/// as items.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: Vec<(DecodedValue, DecodedValue)>,
    index: HashMap<Key, usize>,
    attributes: Vec<(String, DecodedValue)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an item. Replacing an existing key keeps its position and returns the old value.
    pub fn try_insert(
        &mut self,
        key: DecodedValue,
        value: DecodedValue,
    ) -> Result<Option<DecodedValue>, UnhashableKey> {
        let hashed = Key::of(&key).ok_or(UnhashableKey(key.kind()))?;
        match self.index.get(&hashed) {
            Some(&position) => Ok(Some(core::mem::replace(
                &mut self.entries[position].1,
                value,
            ))),
            None => {
                self.index.insert(hashed, self.entries.len());
                self.entries.push((key, value));
                Ok(None)
            }
        }
    }

    /// Insert an item whose key is known to be hashable.
    ///
    /// Unhashable keys are ignored; use [`Dict::try_insert`] to observe them.
    pub fn insert(&mut self, key: DecodedValue, value: DecodedValue) -> Option<DecodedValue> {
        self.try_insert(key, value).ok().flatten()
    }

    pub fn get(&self, key: &DecodedValue) -> Option<&DecodedValue> {
        let position = self.index.get(&Key::of(key)?)?;
        Some(&self.entries[*position].1)
    }

    /// Look up a string key.
    pub fn get_str(&self, key: &str) -> Option<&DecodedValue> {
        let position = self.index.get(&Key::String(key.to_string()))?;
        Some(&self.entries[*position].1)
    }

    /// Look up an integer key.
    pub fn get_int(&self, key: i64) -> Option<&DecodedValue> {
        let position = self.index.get(&Key::Int(key))?;
        Some(&self.entries[*position].1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get_str(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Items in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&DecodedValue, &DecodedValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &DecodedValue> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut DecodedValue> {
        self.entries.iter_mut().map(|(_, v)| v)
    }

    pub fn into_entries(self) -> Vec<(DecodedValue, DecodedValue)> {
        self.entries
    }

    /// Instance attributes, in the order they were set.
    pub fn attributes(&self) -> &[(String, DecodedValue)] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&DecodedValue> {
        self.attributes
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, value)| value)
    }

    /// Set an instance attribute, replacing a previous value of the same name.
    pub fn set_attribute(&mut self, name: String, value: DecodedValue) {
        match self.attributes.iter_mut().find(|(attr, _)| *attr == name) {
            Some((_, slot)) => *slot = value,
            None => self.attributes.push((name, value)),
        }
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries && self.attributes == other.attributes
    }
}

/// A module-qualified global name, e.g. `collections.OrderedDict`.
#[derive(new, Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalRef {
    pub module: String,
    pub name: String,
}

impl GlobalRef {
    pub fn qualified_name(&self) -> String {
        alloc::format!("{}.{}", self.module, self.name)
    }
}

impl fmt::Display for GlobalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// A storage record referenced by a persistent id: `('storage', FloatStorage, '0', 'cpu', 6)`.
#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct StorageRef {
    /// Container-local key, the file name under `data/`.
    pub key: String,
    /// Element type of the storage.
    pub dtype: DType,
    /// Device the storage was saved from. Informational only.
    pub location: String,
    /// Number of elements in the storage.
    pub num_elements: usize,
}

impl StorageRef {
    /// Length of the storage in bytes, if it fits in `usize`.
    pub fn num_bytes(&self) -> Option<usize> {
        self.num_elements.checked_mul(self.dtype.size())
    }
}

/// A tensor view over a storage, as recorded by `_rebuild_tensor_v2`.
#[derive(new, Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    pub storage: StorageRef,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub stride: Vec<i64>,
    /// Offset into the storage, in elements.
    pub storage_offset: usize,
    pub requires_grad: bool,
}

impl TensorDescriptor {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}
