//! Group aggregation over many items' states.
//!
//! A section screen groups several tracks under one control; the control
//! needs a single composite state and a single composite verb. Aggregation
//! reduces the members' actual states by a fixed priority ladder: the first
//! matching rule wins, evaluated top to bottom. The result is
//! order-independent with respect to the input list.

use super::state::{DownloadAction, DownloadState};

/// Composite state over a group of items.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupState {
    /// At least one member has not been checked yet.
    Unknown,
    /// Every member's artifact is present. Also the vacuous result for an
    /// empty group.
    Downloaded,
    /// At least one member is confirmed absent, none in flight.
    NotDownloaded { progress: f64 },
    /// At least one member is transferring.
    Downloading { progress: f64 },
    /// Every member is finalizing or already present.
    Finalizing { progress: f64 },
    /// Every member is cancelling, failed, or absent, with at least one
    /// cancelling.
    Cancelling { progress: f64 },
    /// Every member is deleting, failed, or absent, with at least one
    /// deleting.
    Deleting,
    /// A mix of finalizing, cancelling, and deleting members alongside
    /// other kinds; settles into a terminal shape on its own.
    Resolving { progress: f64 },
    /// At least one member's last attempt failed, none in flight.
    FailedDownloading { progress: f64 },
}

impl GroupState {
    /// Composite progress, where the variant carries one.
    pub fn progress(&self) -> Option<f64> {
        match self {
            Self::NotDownloaded { progress }
            | Self::Downloading { progress }
            | Self::Finalizing { progress }
            | Self::Cancelling { progress }
            | Self::Resolving { progress }
            | Self::FailedDownloading { progress } => Some(*progress),
            Self::Downloaded => Some(1.0),
            Self::Unknown | Self::Deleting => None,
        }
    }

    /// The verb one composite control press should trigger, if any.
    pub fn action(&self) -> Option<DownloadAction> {
        match self {
            Self::Unknown => None,
            Self::Downloading { .. } | Self::Finalizing { .. } => Some(DownloadAction::Cancel),
            Self::Downloaded => Some(DownloadAction::Delete),
            Self::NotDownloaded { .. }
            | Self::Cancelling { .. }
            | Self::Deleting
            | Self::Resolving { .. }
            | Self::FailedDownloading { .. } => Some(DownloadAction::Start),
        }
    }
}

/// Composite state plus the action it implies.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSnapshot {
    pub state: GroupState,
    pub action: Option<DownloadAction>,
}

/// Reduce a group of item states to one composite view.
pub fn aggregate(states: &[DownloadState]) -> GroupSnapshot {
    let state = aggregate_state(states);
    let action = state.action();
    GroupSnapshot { state, action }
}

fn aggregate_state(states: &[DownloadState]) -> GroupState {
    use DownloadState as S;

    if states.iter().any(|s| matches!(s, S::Unknown)) {
        return GroupState::Unknown;
    }

    let progress = average_progress(states);

    if states
        .iter()
        .all(|s| matches!(s, S::Finalizing { .. } | S::Downloaded { .. }))
        && states.iter().any(|s| matches!(s, S::Finalizing { .. }))
    {
        return GroupState::Finalizing { progress: 1.0 };
    }

    if states
        .iter()
        .all(|s| matches!(s, S::Cancelling { .. } | S::FailedDownloading | S::NotDownloaded))
        && states.iter().any(|s| matches!(s, S::Cancelling { .. }))
    {
        return GroupState::Cancelling { progress };
    }

    if states
        .iter()
        .all(|s| matches!(s, S::Deleting | S::FailedDownloading | S::NotDownloaded))
        && states.iter().any(|s| matches!(s, S::Deleting))
    {
        return GroupState::Deleting;
    }

    if states
        .iter()
        .any(|s| matches!(s, S::Finalizing { .. } | S::Cancelling { .. } | S::Deleting))
    {
        return GroupState::Resolving { progress };
    }

    if states.iter().any(|s| matches!(s, S::FailedDownloading)) {
        return GroupState::FailedDownloading { progress };
    }

    if states.iter().any(|s| matches!(s, S::NotDownloaded)) {
        return GroupState::NotDownloaded { progress };
    }

    if states.iter().any(|s| matches!(s, S::Downloading { .. })) {
        return GroupState::Downloading { progress };
    }

    GroupState::Downloaded
}

/// Mean of the members' progress contributions; an empty group is complete.
fn average_progress(states: &[DownloadState]) -> f64 {
    if states.is_empty() {
        return 1.0;
    }
    let total: f64 = states.iter().map(DownloadState::progress_contribution).sum();
    total / states.len() as f64
}
