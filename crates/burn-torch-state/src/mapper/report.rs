use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

/// What an `apply_*_with` call did.
///
/// For module state the entries are tensor names. For optimizer state they are saved parameter
/// ordinals (`"3"`), or `param_groups.<i>` for groups left out by a prefix load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Loaded into the target.
    pub applied: Vec<String>,
    /// Excluded by the options.
    pub skipped: Vec<String>,
    /// Present in the target but not in the saved state.
    pub missing: Vec<String>,
    /// Present in the saved state but not in the target.
    pub unexpected: Vec<String>,
}

impl ApplyReport {
    /// True when every saved entry found a target and every target was filled.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Applied: {}", self.applied.len())?;
        for (label, names) in [
            ("Skipped", &self.skipped),
            ("Missing", &self.missing),
            ("Unexpected", &self.unexpected),
        ] {
            if !names.is_empty() {
                writeln!(f, "{label} ({}): {}", names.len(), names.join(", "))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_only_non_empty_sections() {
        let report = ApplyReport {
            applied: vec!["a".into(), "b".into()],
            missing: vec!["c".into()],
            ..Default::default()
        };
        assert!(!report.is_complete());
        assert_eq!(report.to_string(), "Applied: 2\nMissing (1): c\n");
    }
}
