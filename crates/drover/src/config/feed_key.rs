//! Feed identifier type.

use drover_core::ComponentKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one configured feed.
///
/// The same identifier keys the feed's checkpoint, so it must stay stable
/// across deployments (e.g. `"otx-subscribed"`, `"abuse.ch-feodo"`).
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedKey(ComponentKey);

impl FeedKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(ComponentKey::new(id))
    }

    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn validate(&self) -> Result<(), String> {
        self.0.validate()
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for FeedKey {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl From<ComponentKey> for FeedKey {
    fn from(key: ComponentKey) -> Self {
        Self(key)
    }
}
