//! Global properties handed to rule execution.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Malformed property assignment.
#[derive(Debug, thiserror::Error)]
pub enum PropertyError {
    /// The assignment carried no `=` separator.
    #[error("wrong key format '{0}'")]
    WrongFormat(String),
}

/// Mapping from environment key to optional value, mutated only by the
/// control plane.
///
/// A `None` value means "explicit unset": the key is passed to rule
/// execution as removed rather than merely absent. Workers receive the set
/// by address-space inheritance at spawn, which is why changing it kills
/// the current workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertiesSet {
    entries: BTreeMap<String, Option<String>>,
}

impl PropertiesSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `KEY=value` assignment; an empty value records an explicit
    /// unset.
    ///
    /// # Errors
    ///
    /// Returns [`PropertyError::WrongFormat`] when the assignment has no
    /// `=` separator.
    pub fn apply_assignment(&mut self, assignment: &str) -> Result<(), PropertyError> {
        let Some((key, value)) = assignment.split_once('=') else {
            return Err(PropertyError::WrongFormat(assignment.to_string()));
        };
        if value.is_empty() {
            self.entries.insert(key.to_string(), None);
        } else {
            self.entries.insert(key.to_string(), Some(value.to_string()));
        }
        Ok(())
    }

    /// Look up a key; the outer `Option` is presence, the inner one the
    /// explicit-unset marker.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.entries.get(key).map(|v| v.as_deref())
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Number of entries, explicit unsets included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut props = PropertiesSet::new();
        props.apply_assignment("COLOR=blue").unwrap();

        assert_eq!(props.get("COLOR"), Some(Some("blue")));
        assert_eq!(props.get("MISSING"), None);
    }

    #[test]
    fn test_empty_value_records_unset() {
        let mut props = PropertiesSet::new();
        props.apply_assignment("COLOR=blue").unwrap();
        props.apply_assignment("COLOR=").unwrap();

        assert_eq!(props.get("COLOR"), Some(None));
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn test_missing_separator_rejected() {
        let mut props = PropertiesSet::new();
        let err = props.apply_assignment("COLOR").unwrap_err();
        assert!(matches!(err, PropertyError::WrongFormat(_)));
        assert!(props.is_empty());
    }

    #[test]
    fn test_value_may_contain_separator() {
        let mut props = PropertiesSet::new();
        props.apply_assignment("CMD=a=b").unwrap();
        assert_eq!(props.get("CMD"), Some(Some("a=b")));
    }
}
