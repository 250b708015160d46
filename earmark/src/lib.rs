//! Earmark - offline audio lessons.
//!
//! This library provides the download lifecycle subsystem of the Earmark app:
//! a per-item state machine that reconciles the listener's *requested*
//! availability of a lesson track against its *actual* on-device state,
//! drives the underlying transfer and storage operations, and publishes
//! consistent state to any number of observers.

pub mod downloads;
pub mod telemetry;

pub use downloads::{
    aggregate, DownloadAction, DownloadManager, DownloadState, GroupSnapshot, GroupState,
    ItemDescriptor, ItemId, RequestedState, StorageLayout,
};
