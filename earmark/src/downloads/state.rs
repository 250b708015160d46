//! Requested and actual download state for a single item.
//!
//! The lifecycle manager keeps two facts per item: what the caller *wants*
//! ([`RequestedState`]) and what is *actually* true on device
//! ([`DownloadState`]). Reconciliation between the two drives every transfer
//! and storage operation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Caller intent for an item's local availability.
///
/// Set only through the lifecycle manager's `transition` call and held in
/// memory for the process lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedState {
    /// No request has been made yet.
    #[default]
    None,
    /// The caller wants the item available on device.
    Downloaded,
    /// The caller wants the item absent from the device.
    NotDownloaded,
}

/// Identity token for one transfer attempt.
///
/// Tokens are issued from a monotonically increasing counter and compared as
/// identities: a token never equals one issued to a different attempt. This
/// is what lets the manager discard progress or completion signals from an
/// attempt that has since been superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(u64);

impl AttemptId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// The manager's authoritative view of an item's download progress/presence.
///
/// At most one non-terminal variant is in effect per item at any time; the
/// variant is mutated solely by the lifecycle manager's own transition logic.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum DownloadState {
    /// Existence on durable storage has not been checked yet.
    #[default]
    Unknown,
    /// Confirmed absent.
    NotDownloaded,
    /// Transfer in flight.
    Downloading {
        /// Fraction in `[0, 1]`.
        progress: f64,
        /// Identity of the attempt driving this transfer.
        attempt: AttemptId,
    },
    /// Transfer complete; artifact being moved into its final location.
    Finalizing { progress: f64, attempt: AttemptId },
    /// Cancellation requested; temp-file cleanup pending.
    Cancelling { progress: f64 },
    /// Deletion of the finalized artifact in progress.
    Deleting,
    /// A download attempt ended in error. The reconciliation loop itself
    /// degrades failures to [`DownloadState::NotDownloaded`]; this variant
    /// is part of the vocabulary so group views fed by callers that record
    /// failures aggregate correctly.
    FailedDownloading,
    /// Artifact present at a stable location.
    Downloaded {
        /// Final on-device location.
        uri: PathBuf,
        /// Recorded SHA-256 content hash, when known.
        hash: Option<String>,
    },
}

impl DownloadState {
    /// Whether an operation is currently in flight for this item.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::Downloading { .. } | Self::Finalizing { .. } | Self::Cancelling { .. } | Self::Deleting
        )
    }

    /// The fraction this item contributes to a group progress average.
    ///
    /// In-flight states contribute their own progress, present or
    /// nearly-removed artifacts count as complete, everything else as zero.
    pub fn progress_contribution(&self) -> f64 {
        match self {
            Self::Downloading { progress, .. }
            | Self::Finalizing { progress, .. }
            | Self::Cancelling { progress } => *progress,
            Self::Downloaded { .. } | Self::Deleting => 1.0,
            Self::Unknown | Self::NotDownloaded | Self::FailedDownloading => 0.0,
        }
    }
}

/// The verb a single control press should trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadAction {
    /// Begin downloading the item.
    Start,
    /// Stop an in-flight download.
    Cancel,
    /// Remove the finalized artifact.
    Delete,
}

/// The natural next toggle for a one-button control: the intent the press
/// should record plus the verb it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TogglePlan {
    /// Requested state the press should record.
    pub target: RequestedState,
    /// Operation that intent implies from the current actual state.
    pub action: DownloadAction,
}

impl TogglePlan {
    /// Derive the toggle for the given actual state.
    pub fn for_state(state: &DownloadState) -> Self {
        match state {
            DownloadState::Downloaded { .. } => Self {
                target: RequestedState::NotDownloaded,
                action: DownloadAction::Delete,
            },
            DownloadState::Downloading { .. } | DownloadState::Finalizing { .. } => Self {
                target: RequestedState::NotDownloaded,
                action: DownloadAction::Cancel,
            },
            _ => Self {
                target: RequestedState::Downloaded,
                action: DownloadAction::Start,
            },
        }
    }
}
