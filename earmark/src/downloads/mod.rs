//! Download lifecycle management for lesson audio.
//!
//! This module reconciles what the listener *wants* on device against what
//! is *actually* there, one item at a time, and keeps every observer
//! consistent while transfers, cancellations, and deletions run:
//! - Per-item requested/actual state machine (`manager`)
//! - State vocabulary and toggle derivation (`state`)
//! - Composite state over groups of items (`aggregate`)
//! - UI bindings with post-drop suppression (`watch`)
//! - Collaborator contracts (`transfer`, `store`) and the bundled
//!   implementations (`http`, `store`)
//! - Artifact placement (`layout`)
//!
//! # Architecture
//!
//! ```text
//! DownloadManager (reconciliation)
//!         │
//!         ├── TransferClient (trait)
//!         │       └── HttpTransferClient (resumable HTTP)
//!         │
//!         ├── ContentStore (trait)
//!         │       └── FsContentStore (probe / move / delete)
//!         │
//!         ├── StorageLayout (staging + final paths)
//!         │
//!         └── subscribers ──► ItemWatcher / GroupWatcher ──► UI
//!                                      │
//!                                      └── aggregate() (composite view)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use earmark::downloads::{
//!     DownloadManager, FsContentStore, HttpTransferClient, ItemDescriptor,
//!     ItemWatcher, StorageLayout,
//! };
//!
//! let manager = DownloadManager::new(
//!     Arc::new(HttpTransferClient::new()),
//!     Arc::new(FsContentStore::new()),
//!     StorageLayout::new("/data/earmark/library"),
//! );
//!
//! let item = ItemDescriptor::new("intro-01", "https://cdn.example.com/intro-01.mp3", "mp3");
//! let watcher = ItemWatcher::attach(Arc::clone(&manager), item, || {
//!     // invalidate the view
//! });
//!
//! watcher.start(); // request the track on device
//! ```

mod aggregate;
mod http;
mod item;
mod layout;
mod manager;
mod state;
mod store;
mod transfer;
mod watch;

pub use aggregate::{aggregate, GroupSnapshot, GroupState};
pub use http::HttpTransferClient;
pub use item::{ItemDescriptor, ItemId};
pub use layout::StorageLayout;
pub use manager::{ChangeCallback, DownloadManager, Subscription};
pub use state::{AttemptId, DownloadAction, DownloadState, RequestedState, TogglePlan};
pub use store::{ContentStore, FsContentStore, Probe, StoreError};
pub use transfer::{
    BoxFuture, ProgressSink, TransferClient, TransferError, TransferOutcome, TransferRequest,
    TransferTask,
};
pub use watch::{GroupWatcher, ItemWatcher};
