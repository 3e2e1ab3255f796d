//! Generic component identifier.
//!
//! Specialized as `FeedKey` in the drover crate. The identifier doubles as a
//! storage key, so it has to be usable as a single object path segment.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for one configured component.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentKey(String);

impl ComponentKey {
    /// Create a new component key from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying identifier string.
    pub fn id(&self) -> &str {
        &self.0
    }

    /// Check that the key can be used as a path segment.
    ///
    /// Returns a description of the problem when it cannot.
    pub fn validate(&self) -> Result<(), String> {
        if self.0.trim().is_empty() {
            return Err("identifier cannot be empty".to_string());
        }
        if let Some(c) = self.0.chars().find(|c| matches!(c, '/' | '\\') || c.is_whitespace()) {
            return Err(format!("identifier cannot contain {c:?}"));
        }
        if self.0 == "." || self.0 == ".." {
            return Err("identifier cannot be a relative path".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ComponentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ComponentKey {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
