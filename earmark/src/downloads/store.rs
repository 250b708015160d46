//! Contract for the durable artifact store, plus the bundled filesystem
//! implementation.
//!
//! The store answers three questions for the lifecycle manager: does an
//! artifact exist (and what is its hash), can it be moved atomically into
//! its final location, and can it be deleted. Deleting a missing path is
//! not an error; the manager leans on that for best-effort cleanup.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::transfer::BoxFuture;

/// Buffer size for reading files during hashing (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to read or stat an artifact.
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    /// Failed to move an artifact into place.
    #[error("failed to move {} to {}: {source}", from.display(), to.display())]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    /// Failed to delete an artifact.
    #[error("failed to delete {}: {source}", path.display())]
    Delete { path: PathBuf, source: io::Error },
}

/// Result of an existence probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Whether an artifact exists at the probed path.
    pub exists: bool,
    /// SHA-256 of the artifact (lowercase hex), when computed.
    pub hash: Option<String>,
}

/// Durable artifact store keyed by path.
pub trait ContentStore: Send + Sync {
    /// Check whether an artifact exists, computing its hash when cheap to do.
    fn probe(&self, path: &Path) -> BoxFuture<'_, Result<Probe, StoreError>>;

    /// Atomically move an artifact into its final location.
    fn rename(&self, from: &Path, to: &Path) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Delete an artifact. Deleting a nonexistent path is not an error.
    fn remove(&self, path: &Path) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Filesystem-backed content store.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    /// Whether probes compute a SHA-256 of existing artifacts.
    hash_on_probe: bool,
}

impl Default for FsContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FsContentStore {
    /// Create a store that hashes artifacts during probes.
    pub fn new() -> Self {
        Self { hash_on_probe: true }
    }

    /// Enable or disable hashing during probes.
    ///
    /// Skipping the hash makes probes metadata-only, which matters on
    /// low-end devices with large audio libraries.
    pub fn with_hash_on_probe(mut self, hash_on_probe: bool) -> Self {
        self.hash_on_probe = hash_on_probe;
        self
    }
}

impl ContentStore for FsContentStore {
    fn probe(&self, path: &Path) -> BoxFuture<'_, Result<Probe, StoreError>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => {
                    let hash = if self.hash_on_probe {
                        Some(hash_file(&path).await?)
                    } else {
                        None
                    };
                    Ok(Probe { exists: true, hash })
                }
                Ok(_) => Ok(Probe {
                    exists: false,
                    hash: None,
                }),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Probe {
                    exists: false,
                    hash: None,
                }),
                Err(source) => Err(StoreError::Read { path, source }),
            }
        })
    }

    fn rename(&self, from: &Path, to: &Path) -> BoxFuture<'_, Result<(), StoreError>> {
        let from = from.to_path_buf();
        let to = to.to_path_buf();
        Box::pin(async move {
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::Move {
                        from: from.clone(),
                        to: to.clone(),
                        source,
                    })?;
            }

            match tokio::fs::rename(&from, &to).await {
                Ok(()) => Ok(()),
                Err(rename_err) => {
                    // Staging and library may live on different filesystems;
                    // fall back to copy + delete.
                    debug!(
                        from = %from.display(),
                        to = %to.display(),
                        error = %rename_err,
                        "rename failed; falling back to copy"
                    );
                    tokio::fs::copy(&from, &to)
                        .await
                        .map_err(|source| StoreError::Move {
                            from: from.clone(),
                            to: to.clone(),
                            source,
                        })?;
                    if let Err(err) = tokio::fs::remove_file(&from).await {
                        debug!(path = %from.display(), error = %err, "leftover staging file not removed");
                    }
                    Ok(())
                }
            }
        })
    }

    fn remove(&self, path: &Path) -> BoxFuture<'_, Result<(), StoreError>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(StoreError::Delete { path, source }),
            }
        })
    }
}

/// Calculate the SHA-256 of a file, returned as lowercase hex.
pub(crate) async fn hash_file(path: &Path) -> Result<String, StoreError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|source| StoreError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
