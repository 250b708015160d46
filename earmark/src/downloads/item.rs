//! Item identity and descriptors.
//!
//! An *item* is one downloadable content unit (an audio track). The
//! descriptor carries everything the lifecycle manager needs to fetch and
//! place it; the manager never mutates descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier for one downloadable content unit.
///
/// Immutable for the item's lifetime and unique across the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Create an identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Caller-supplied description of a downloadable item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    /// Unique item identity.
    pub id: ItemId,

    /// Remote locator the audio is fetched from.
    pub source_url: String,

    /// File extension of the stored artifact, without the leading dot.
    pub file_extension: String,

    /// Expected SHA-256 content hash (lowercase hex), when the catalog
    /// publishes one.
    #[serde(default)]
    pub expected_hash: Option<String>,
}

impl ItemDescriptor {
    /// Create a descriptor without an expected content hash.
    pub fn new(
        id: impl Into<ItemId>,
        source_url: impl Into<String>,
        file_extension: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            file_extension: file_extension.into(),
            expected_hash: None,
        }
    }

    /// Attach the expected content hash published by the catalog.
    pub fn with_expected_hash(mut self, hash: impl Into<String>) -> Self {
        self.expected_hash = Some(hash.into());
        self
    }
}
