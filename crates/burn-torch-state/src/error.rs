use alloc::string::String;
use alloc::vec::Vec;

use crate::tensor::DType;

/// Errors raised while reading a checkpoint: decoding the opcode stream, walking a container
/// or materializing tensors.
///
/// Decode errors carry the byte offset of the opcode (or argument) that failed so a broken
/// file can be inspected with `pickletools`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The stream contains an opcode outside of the supported set.
    #[error("Unsupported pickle opcode 0x{opcode:02x} at offset {offset}")]
    UnsupportedOpcode {
        /// The raw opcode byte.
        opcode: u8,
        /// Offset of the opcode in the stream.
        offset: u64,
    },

    /// The stream references a global that is not in the registry.
    #[error(
        "Unsupported global '{name}' at offset {offset}. Only tensors, storages and plain \
         containers can be loaded; save with `torch.save(model.state_dict(), ...)`"
    )]
    UnsupportedGlobal {
        /// Module-qualified name, e.g. `torch.nn.modules.linear.Linear`.
        name: String,
        /// Offset of the opcode that named it.
        offset: u64,
    },

    /// The stream ended before a STOP opcode or in the middle of an argument.
    #[error("Pickle stream truncated at offset {offset}")]
    TruncatedStream {
        /// Offset at which more bytes were expected.
        offset: u64,
    },

    /// The stream is complete but structurally invalid.
    #[error("Invalid pickle data at offset {offset}: {message}")]
    InvalidData {
        /// Offset of the opcode being executed.
        offset: u64,
        /// What went wrong.
        message: String,
    },

    /// A GET opcode referenced a memo slot that was never filled.
    #[error("Pickle memo reference {index} not found (offset {offset})")]
    MemoNotFound {
        /// The memo index.
        index: u32,
        /// Offset of the GET opcode.
        offset: u64,
    },

    /// The archive directory is inconsistent or an entry cannot be read.
    #[error("Corrupt zip archive: {reason}")]
    CorruptZip {
        /// Details from the zip reader.
        reason: String,
    },

    /// The file is not in a format this crate reads.
    #[error("Unsupported checkpoint format: {reason}")]
    UnsupportedFormat {
        /// Why the input was rejected.
        reason: String,
    },

    /// A persistent id references a storage entry that is not in the archive.
    #[error("Storage '{key}' not found in archive")]
    StorageNotFound {
        /// The container-local storage key.
        key: String,
    },

    /// Tensor metadata disagrees with its backing storage.
    #[error("Corrupt tensor: {reason}{}", format_index(.index))]
    CorruptTensor {
        /// What went wrong.
        reason: String,
        /// The offending element index, when one can be named.
        index: Option<Vec<usize>>,
    },

    /// The safetensors header could not be parsed.
    #[error("Failed to parse safetensors header: {reason}")]
    HeaderParseError {
        /// Details from the parser.
        reason: String,
    },

    /// A safetensors byte span is out of bounds or overlaps another one.
    #[error("Tensor '{name}' data offsets [{start}, {end}) are out of range (limit {limit})")]
    OffsetOutOfRange {
        /// Tensor name.
        name: String,
        /// Start of the span.
        start: usize,
        /// End of the span.
        end: usize,
        /// The bound that was violated (payload length or end of the previous span).
        limit: usize,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_index(index: &Option<Vec<usize>>) -> String {
    match index {
        Some(index) => alloc::format!(" (index {index:?})"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn invalid(offset: u64, message: impl Into<String>) -> Self {
        Self::InvalidData {
            offset,
            message: message.into(),
        }
    }

    pub(crate) fn corrupt_tensor(reason: impl Into<String>) -> Self {
        Self::CorruptTensor {
            reason: reason.into(),
            index: None,
        }
    }
}

/// Result type of the load stage.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised while applying decoded state to a live optimizer or module.
///
/// Every check runs before the first mutation, so receiving one of these means the target
/// was left untouched.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    /// A saved tensor does not have the shape of the slot it maps to.
    #[error("Shape mismatch for {param}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Parameter name, or a positional description for optimizer state.
        param: String,
        /// Shape of the target slot.
        expected: Vec<usize>,
        /// Shape of the saved tensor.
        found: Vec<usize>,
    },

    /// The saved optimizer has a different number of parameter groups than the target.
    #[error("Saved state has {saved} parameter groups but the optimizer has {target}")]
    ParamGroupCountMismatch {
        /// Number of saved groups.
        saved: usize,
        /// Number of target groups.
        target: usize,
    },

    /// A saved parameter group lists a different number of parameters than its target group.
    #[error("Parameter group {group} has {saved} saved parameters but the optimizer has {target}")]
    ParamCountMismatch {
        /// Group position.
        group: usize,
        /// Number of saved parameter ordinals.
        saved: usize,
        /// Number of target parameter slots.
        target: usize,
    },

    /// A saved tensor has a different dtype than its slot.
    #[error("Type mismatch for {param}: expected {expected}, found {found}")]
    DTypeMismatch {
        /// Parameter name.
        param: String,
        /// Dtype of the target slot.
        expected: DType,
        /// Dtype of the saved tensor.
        found: DType,
    },

    /// A target slot has no saved tensor.
    #[error("Missing tensor for '{name}'")]
    MissingTensor {
        /// Target slot name.
        name: String,
    },

    /// A saved tensor has no target slot.
    #[error("Unexpected tensor '{name}' in saved state")]
    UnexpectedTensor {
        /// Saved name.
        name: String,
    },

    /// A module state entry is not a tensor.
    #[error("Entry '{name}' in module state is not a tensor")]
    NotATensor {
        /// Saved name.
        name: String,
    },

    /// The decoded value does not have the structure of the requested state kind.
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// What was expected.
        reason: String,
    },
}

impl MappingError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }
}
