//! The closed set of globals a checkpoint may reference.
//!
//! A pickle stream names classes and functions by module-qualified name and expects the reader
//! to import and call them. Here every name resolves through a static table instead: a name
//! that is not listed fails the decode, and a listed name only ever builds one of the values
//! in [`crate::DecodedValue`]. The table is a `match` and carries no state, so it can be used
//! from any number of threads.

use crate::tensor::DType;

/// A registered global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Global {
    /// `torch._utils._rebuild_tensor(storage, offset, size, stride)`
    RebuildTensor,
    /// `torch._utils._rebuild_tensor_v2(storage, offset, size, stride, requires_grad, hooks)`,
    /// with an optional trailing `metadata`
    RebuildTensorV2,
    /// `torch._utils._rebuild_parameter(data, requires_grad, hooks)`
    RebuildParameter,
    /// `torch._tensor._rebuild_from_type_v2(func, new_type, args, state)`
    RebuildFromTypeV2,
    /// `collections.OrderedDict`
    OrderedDict,
    /// `_codecs.encode(text, encoding)`, used by protocol 2 to pickle `bytes`.
    CodecsEncode,
    /// `builtins.set`
    Set,
    /// `builtins.frozenset`
    FrozenSet,
    /// A typed storage class such as `torch.FloatStorage`. Only valid inside a persistent id.
    Storage(DType),
    /// `torch.Tensor` or `torch.nn.parameter.Parameter`. Only valid as the type argument of
    /// `_rebuild_from_type_v2`.
    TensorType,
}

impl Global {
    /// Whether REDUCE may call this global.
    pub fn is_callable(&self) -> bool {
        !matches!(self, Global::Storage(_) | Global::TensorType)
    }
}

/// Look up a global by module and name.
pub fn resolve(module: &str, name: &str) -> Option<Global> {
    let global = match (module, name) {
        ("torch._utils", "_rebuild_tensor") => Global::RebuildTensor,
        ("torch._utils", "_rebuild_tensor_v2") => Global::RebuildTensorV2,
        ("torch._utils", "_rebuild_parameter") => Global::RebuildParameter,
        ("torch._tensor", "_rebuild_from_type_v2") => Global::RebuildFromTypeV2,
        ("collections", "OrderedDict") => Global::OrderedDict,
        ("_codecs", "encode") => Global::CodecsEncode,
        ("builtins" | "__builtin__", "set") => Global::Set,
        ("builtins" | "__builtin__", "frozenset") => Global::FrozenSet,
        ("torch", "Tensor") | ("torch.nn.parameter", "Parameter") => Global::TensorType,
        ("torch", storage) => Global::Storage(DType::from_storage_name(storage)?),
        _ => return None,
    };
    Some(global)
}
