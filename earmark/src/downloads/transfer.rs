//! Contract for the resumable transfer primitive.
//!
//! The lifecycle manager treats transfers as opaque: it begins one against a
//! staging destination, receives progress fractions through a callback, may
//! ask it to cancel, and eventually observes a terminal outcome. Anything
//! that can satisfy this contract (the bundled HTTP client, a platform
//! download service, a scripted fake in tests) can drive the manager.
//!
//! # Dyn Compatibility
//!
//! The traits use `Pin<Box<dyn Future>>` returns so they can be held as
//! trait objects (`Arc<dyn TransferClient>`) by the manager.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Progress callback invoked with a completed fraction in `[0, 1]`.
///
/// May be invoked from any thread; implementations forward into the manager,
/// which filters signals from superseded attempts.
pub type ProgressSink = Arc<dyn Fn(f64) + Send + Sync>;

/// Errors a transfer implementation can surface.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The request could not be issued or the connection broke mid-stream.
    #[error("transfer request failed: {0}")]
    Request(String),

    /// The remote answered with an unusable status code.
    #[error("unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    /// I/O error writing the staging file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transfer was cancelled cooperatively.
    #[error("transfer cancelled")]
    Cancelled,

    /// The transfer can no longer be cancelled.
    #[error("transfer is no longer cancellable")]
    NotCancellable,
}

/// Parameters for one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Remote locator to fetch.
    pub source_url: String,
    /// Staging destination the bytes are written to. Never the final
    /// artifact location.
    pub destination: PathBuf,
    /// Whether the implementation should compute a content hash of the
    /// delivered bytes.
    pub verify_hash: bool,
}

/// Terminal result of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Where the delivered bytes ended up (the requested destination).
    pub temp_path: PathBuf,
    /// SHA-256 of the delivered bytes (lowercase hex) when hashing was
    /// requested and supported.
    pub content_hash: Option<String>,
    /// Status code of the final response, for diagnostics.
    pub http_status: u16,
}

/// Handle to one in-flight transfer attempt.
pub trait TransferTask: Send + Sync {
    /// Ask the transfer to stop.
    ///
    /// Cancellation is cooperative; an error means the attempt could not be
    /// stopped and is still running.
    fn cancel(&self) -> BoxFuture<'_, Result<(), TransferError>>;

    /// Wait for the terminal outcome.
    ///
    /// `None` signals an ambiguous end (cancelled, paused, or no usable
    /// result) and must be treated as failure. Resolves once; later calls
    /// return `None`.
    fn join(&self) -> BoxFuture<'_, Option<TransferOutcome>>;
}

/// Factory for transfer attempts.
pub trait TransferClient: Send + Sync {
    /// Begin a transfer, reporting progress through `on_progress`.
    ///
    /// Returns immediately with a handle; the transfer runs in the
    /// background until it completes, fails, or is cancelled.
    fn begin(&self, request: TransferRequest, on_progress: ProgressSink) -> Arc<dyn TransferTask>;
}
