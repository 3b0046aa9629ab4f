use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MappingError;

/// What to do when the saved optimizer and the target have different numbers of param groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupCountPolicy {
    /// Fail with [`MappingError::ParamGroupCountMismatch`].
    #[default]
    Strict,
    /// Apply the groups both sides have, in order, and report the rest as skipped.
    Prefix,
}

/// Options for [`apply_optimizer_state_with`](super::apply_optimizer_state_with).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizerLoadOptions {
    #[serde(default)]
    pub group_count: GroupCountPolicy,
}

impl OptimizerLoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group_count(mut self, policy: GroupCountPolicy) -> Self {
        self.group_count = policy;
        self
    }

    /// Shorthand for [`GroupCountPolicy::Prefix`].
    pub fn allow_partial(self) -> Self {
        self.with_group_count(GroupCountPolicy::Prefix)
    }
}

/// What to do with a name present on only one side of a module state load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnmatchedPolicy {
    /// Abort the load.
    #[default]
    Error,
    /// Log a warning and continue.
    Warn,
    /// Continue silently. The name still shows up in the [`ApplyReport`](super::ApplyReport).
    Ignore,
}

/// Options for [`apply_module_state_with`](super::apply_module_state_with).
///
/// Options can be read from a config file:
///
/// ```rust
/// use burn_torch_state::{ModuleLoadOptions, UnmatchedPolicy};
///
/// let options: ModuleLoadOptions = serde_json::from_str(
///     r#"{"unexpected": "Warn", "missing": "Error", "skip": ["head.weight"]}"#,
/// )
/// .unwrap();
/// assert_eq!(options.unexpected, UnmatchedPolicy::Warn);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleLoadOptions {
    /// Saved tensors without a target slot.
    #[serde(default)]
    pub unexpected: UnmatchedPolicy,
    /// Target slots without a saved tensor.
    #[serde(default)]
    pub missing: UnmatchedPolicy,
    /// Names left out of the load on both sides.
    #[serde(default)]
    pub skip: Vec<String>,
    /// `(pattern, replacement)` rules renaming saved keys before matching. Patterns are
    /// regular expressions matched against the whole key; the first matching rule wins and
    /// the replacement may use capture groups (`$1`).
    #[serde(default)]
    pub key_remap: Vec<(String, String)>,
    /// Also require saved tensors to have the slot's dtype.
    #[serde(default)]
    pub validate_dtype: bool,
}

impl Default for ModuleLoadOptions {
    fn default() -> Self {
        Self::strict()
    }
}

impl ModuleLoadOptions {
    /// Every saved tensor must fill exactly one slot and every slot must be filled.
    pub fn strict() -> Self {
        Self {
            unexpected: UnmatchedPolicy::Error,
            missing: UnmatchedPolicy::Error,
            skip: Vec::new(),
            key_remap: Vec::new(),
            validate_dtype: false,
        }
    }

    /// Load what matches and warn about the rest.
    pub fn lenient() -> Self {
        Self {
            unexpected: UnmatchedPolicy::Warn,
            missing: UnmatchedPolicy::Warn,
            ..Self::strict()
        }
    }

    pub fn with_unexpected(mut self, policy: UnmatchedPolicy) -> Self {
        self.unexpected = policy;
        self
    }

    pub fn with_missing(mut self, policy: UnmatchedPolicy) -> Self {
        self.missing = policy;
        self
    }

    pub fn with_skip(mut self, name: impl Into<String>) -> Self {
        self.skip.push(name.into());
        self
    }

    /// Add a key remapping rule, e.g. `with_key_remap(r"model\.(.*)", "$1")`.
    pub fn with_key_remap(mut self, pattern: &str, replacement: &str) -> Self {
        self.key_remap
            .push((pattern.to_string(), replacement.to_string()));
        self
    }

    pub fn with_dtype_validation(mut self, validate: bool) -> Self {
        self.validate_dtype = validate;
        self
    }

    pub(crate) fn remapper(&self) -> Result<KeyRemapper, MappingError> {
        let rules = self
            .key_remap
            .iter()
            .map(|(pattern, replacement)| {
                Regex::new(&format!("^(?:{pattern})$"))
                    .map(|regex| (regex, replacement.clone()))
                    .map_err(|e| {
                        MappingError::invalid(format!("invalid key remap pattern '{pattern}': {e}"))
                    })
            })
            .collect::<Result<_, _>>()?;
        Ok(KeyRemapper { rules })
    }
}

/// Compiled [`ModuleLoadOptions::key_remap`] rules.
pub(crate) struct KeyRemapper {
    rules: Vec<(Regex, String)>,
}

impl KeyRemapper {
    pub fn remap(&self, key: &str) -> String {
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(key))
            .map(|(regex, replacement)| regex.replace(key, replacement.as_str()).into_owned())
            .unwrap_or_else(|| key.to_string())
    }
}
