//! Storage layout: where staged and finalized artifacts live on disk.
//!
//! Paths are derived deterministically from the item identity so that the
//! same item always stages and lands in the same place, while distinct items
//! can never collide even after identifier sanitization.

use std::path::PathBuf;

use sha2::{Digest, Sha256};

use super::item::ItemDescriptor;

/// Longest sanitized identifier fragment kept in a file name.
const MAX_STEM_CHARS: usize = 64;

/// Configuration for artifact placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    /// Directory finalized artifacts live in.
    library_dir: PathBuf,
    /// Directory in-flight transfers stage their bytes in.
    staging_dir: PathBuf,
}

impl Default for StorageLayout {
    fn default() -> Self {
        let library_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("earmark")
            .join("library");
        Self {
            library_dir,
            staging_dir: std::env::temp_dir().join("earmark-staging"),
        }
    }
}

impl StorageLayout {
    /// Create a layout with the given library directory and the default
    /// staging directory.
    pub fn new(library_dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: library_dir.into(),
            ..Default::default()
        }
    }

    /// Set the staging directory.
    pub fn with_staging_dir(mut self, staging_dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = staging_dir.into();
        self
    }

    /// Directory finalized artifacts live in.
    pub fn library_dir(&self) -> &PathBuf {
        &self.library_dir
    }

    /// Directory in-flight transfers stage their bytes in.
    pub fn staging_dir(&self) -> &PathBuf {
        &self.staging_dir
    }

    /// Final, stable location of an item's artifact.
    pub fn final_path(&self, item: &ItemDescriptor) -> PathBuf {
        self.library_dir
            .join(format!("{}.{}", file_stem(item), item.file_extension))
    }

    /// Staging location an item's transfer writes to.
    ///
    /// Distinct from the final location; the artifact is moved into place
    /// only after the transfer completes.
    pub fn staging_path(&self, item: &ItemDescriptor) -> PathBuf {
        self.staging_dir
            .join(format!("{}.{}.part", file_stem(item), item.file_extension))
    }
}

/// Deterministic, collision-free file stem for an item.
///
/// The sanitized identifier keeps names readable; the hash suffix keeps
/// distinct identifiers distinct even when sanitization or truncation would
/// otherwise merge them.
fn file_stem(item: &ItemDescriptor) -> String {
    let sanitized: String = item
        .id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();

    let digest = Sha256::digest(item.id.as_str().as_bytes());
    let tag: String = format!("{:x}", digest).chars().take(8).collect();

    format!("{sanitized}-{tag}")
}
