//! Per-item download lifecycle reconciliation.
//!
//! [`DownloadManager`] owns one entry per content item: the caller's
//! requested state, the actual state, and the item's subscribers. Every
//! externally visible change flows through `transition`, which compares the
//! two states against a fixed table and starts at most one operation.
//! Operation completions re-enter the same table with the *latest* requested
//! state, which is what makes rapid toggling converge without a queue: each
//! operation, on finishing, hands off to a fresh evaluation.
//!
//! Mutation happens in discrete lock-guarded steps; the registry lock is
//! never held across an `await`. Progress and completion signals carry the
//! attempt identity that produced them and are dropped when a newer attempt
//! owns the item.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::item::{ItemDescriptor, ItemId};
use super::layout::StorageLayout;
use super::state::{AttemptId, DownloadState, RequestedState, TogglePlan};
use super::store::ContentStore;
use super::transfer::{
    ProgressSink, TransferClient, TransferOutcome, TransferRequest, TransferTask,
};

/// Callback invoked on every state mutation of a subscribed item.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle to one in-flight transfer attempt, kept so a cancel request can
/// reach it.
struct ActiveTransfer {
    attempt: AttemptId,
    task: Arc<dyn TransferTask>,
}

/// Everything the manager tracks for one item.
#[derive(Default)]
struct ItemEntry {
    requested: RequestedState,
    actual: DownloadState,
    active: Option<ActiveTransfer>,
    probing: bool,
    subscribers: Vec<(u64, ChangeCallback)>,
}

/// Operation the transition table selected.
enum PlannedOp {
    StartDownload,
    Cancel,
    Delete,
}

/// Owns every item's requested/actual state pair and drives reconciliation.
pub struct DownloadManager {
    transfer: Arc<dyn TransferClient>,
    store: Arc<dyn ContentStore>,
    layout: StorageLayout,
    items: Mutex<HashMap<ItemId, ItemEntry>>,
    attempt_counter: AtomicU64,
    subscriber_counter: AtomicU64,
}

impl DownloadManager {
    /// Create a manager over the given collaborators.
    pub fn new(
        transfer: Arc<dyn TransferClient>,
        store: Arc<dyn ContentStore>,
        layout: StorageLayout,
    ) -> Arc<Self> {
        Arc::new(Self {
            transfer,
            store,
            layout,
            items: Mutex::new(HashMap::new()),
            attempt_counter: AtomicU64::new(0),
            subscriber_counter: AtomicU64::new(0),
        })
    }

    /// The layout this manager places artifacts with.
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The caller's standing request for an item; `None` for unseen items.
    pub fn requested_state(&self, id: &ItemId) -> RequestedState {
        self.items
            .lock()
            .get(id)
            .map(|entry| entry.requested)
            .unwrap_or_default()
    }

    /// The actual state of an item; `Unknown` for unseen items.
    pub fn actual_state(&self, id: &ItemId) -> DownloadState {
        self.items
            .lock()
            .get(id)
            .map(|entry| entry.actual.clone())
            .unwrap_or_default()
    }

    /// The natural next toggle for a one-button control on this item.
    pub fn toggle_plan(&self, id: &ItemId) -> TogglePlan {
        TogglePlan::for_state(&self.actual_state(id))
    }

    /// Whether the standing request logically contradicts the actual state.
    ///
    /// In-flight states count as on track, not contradictory.
    pub fn has_unsatisfied_request(&self, id: &ItemId) -> bool {
        let items = self.items.lock();
        let Some(entry) = items.get(id) else {
            return false;
        };
        match entry.requested {
            RequestedState::None => false,
            RequestedState::Downloaded => matches!(
                entry.actual,
                DownloadState::NotDownloaded | DownloadState::FailedDownloading
            ),
            RequestedState::NotDownloaded => {
                matches!(entry.actual, DownloadState::Downloaded { .. })
            }
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register a callback invoked on every state mutation of the item.
    ///
    /// The returned guard removes exactly this callback when dropped or
    /// explicitly unsubscribed. Callbacks run synchronously within the
    /// mutating step; no coalescing.
    pub fn subscribe(
        self: &Arc<Self>,
        id: &ItemId,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        let token = self.subscriber_counter.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut items = self.items.lock();
            let entry = items.entry(id.clone()).or_default();
            entry.subscribers.push((token, Arc::new(callback)));
        }
        Subscription {
            manager: Arc::downgrade(self),
            id: id.clone(),
            token,
        }
    }

    fn notify(&self, id: &ItemId) {
        let callbacks: Vec<ChangeCallback> = {
            let items = self.items.lock();
            items
                .get(id)
                .map(|entry| {
                    entry
                        .subscribers
                        .iter()
                        .map(|(_, callback)| Arc::clone(callback))
                        .collect()
                })
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback();
        }
    }

    // =========================================================================
    // Existence probe
    // =========================================================================

    /// Resolve an `Unknown` item against the content store.
    ///
    /// No-op when the state is already known or a probe is in flight. A
    /// probe result is discarded if the state stopped being `Unknown` while
    /// the probe ran. Probe failure leaves the state `Unknown`; the next
    /// call retries.
    pub fn ensure_known(self: &Arc<Self>, item: &ItemDescriptor) {
        {
            let mut items = self.items.lock();
            let entry = items.entry(item.id.clone()).or_default();
            if !matches!(entry.actual, DownloadState::Unknown) || entry.probing {
                return;
            }
            entry.probing = true;
        }

        let manager = Arc::clone(self);
        let item = item.clone();
        let final_path = self.layout.final_path(&item);
        tokio::spawn(async move {
            let probe = manager.store.probe(&final_path).await;
            let changed = {
                let mut items = manager.items.lock();
                let Some(entry) = items.get_mut(&item.id) else {
                    return;
                };
                entry.probing = false;
                match probe {
                    Ok(probe) if matches!(entry.actual, DownloadState::Unknown) => {
                        entry.actual = if probe.exists {
                            DownloadState::Downloaded {
                                uri: final_path.clone(),
                                hash: probe.hash,
                            }
                        } else {
                            DownloadState::NotDownloaded
                        };
                        true
                    }
                    Ok(_) => {
                        debug!(item = %item.id, "probe result discarded; state already known");
                        false
                    }
                    Err(err) => {
                        warn!(item = %item.id, error = %err, "existence probe failed");
                        false
                    }
                }
            };
            if changed {
                manager.notify(&item.id);
            }
        });
    }

    // =========================================================================
    // Transition
    // =========================================================================

    /// Record a new requested state and reconcile against the actual state.
    ///
    /// Performs at most one operation per call, chosen from a fixed table.
    /// Subscribers are notified even when no operation starts, so observers
    /// always see the latest intent.
    pub fn transition(self: &Arc<Self>, item: &ItemDescriptor, target: RequestedState) {
        let planned = {
            let mut items = self.items.lock();
            let entry = items.entry(item.id.clone()).or_default();
            entry.requested = target;
            plan(&entry.actual, target, &item.id)
        };

        self.notify(&item.id);

        match planned {
            Some(PlannedOp::StartDownload) => self.begin_download(item),
            Some(PlannedOp::Cancel) => self.begin_cancel(item),
            Some(PlannedOp::Delete) => self.begin_delete(item),
            None => {}
        }
    }

    // =========================================================================
    // Download
    // =========================================================================

    fn begin_download(self: &Arc<Self>, item: &ItemDescriptor) {
        let attempt = AttemptId::new(self.attempt_counter.fetch_add(1, Ordering::SeqCst) + 1);
        let staging = self.layout.staging_path(item);

        let progress_sink: ProgressSink = {
            let manager = Arc::downgrade(self);
            let id = item.id.clone();
            Arc::new(move |fraction: f64| {
                if let Some(manager) = manager.upgrade() {
                    manager.apply_progress(&id, attempt, fraction);
                }
            })
        };

        let request = TransferRequest {
            source_url: item.source_url.clone(),
            destination: staging.clone(),
            verify_hash: true,
        };
        let task = self.transfer.begin(request, progress_sink);

        {
            let mut items = self.items.lock();
            let entry = items.entry(item.id.clone()).or_default();
            if !matches!(
                entry.actual,
                DownloadState::NotDownloaded | DownloadState::FailedDownloading
            ) {
                // A re-entrant transition moved the item while this call was
                // being set up; abandon the attempt before it is observable.
                drop(items);
                debug!(item = %item.id, "download start superseded before it began");
                let stale = Arc::clone(&task);
                tokio::spawn(async move {
                    let _ = stale.cancel().await;
                });
                return;
            }
            entry.actual = DownloadState::Downloading {
                progress: 0.0,
                attempt,
            };
            entry.active = Some(ActiveTransfer {
                attempt,
                task: Arc::clone(&task),
            });
        }
        self.notify(&item.id);
        info!(item = %item.id, attempt = ?attempt, "download started");

        let manager = Arc::clone(self);
        let item = item.clone();
        tokio::spawn(async move {
            let outcome = task.join().await;
            manager.finish_download(&item, attempt, &staging, outcome).await;
        });
    }

    fn apply_progress(&self, id: &ItemId, attempt: AttemptId, fraction: f64) {
        let changed = {
            let mut items = self.items.lock();
            match items.get_mut(id) {
                Some(entry) => match &mut entry.actual {
                    DownloadState::Downloading {
                        progress,
                        attempt: current,
                    } if *current == attempt => {
                        *progress = fraction.clamp(0.0, 1.0);
                        true
                    }
                    _ => {
                        debug!(item = %id, "progress from a superseded attempt dropped");
                        false
                    }
                },
                None => false,
            }
        };
        if changed {
            self.notify(id);
        }
    }

    async fn finish_download(
        self: &Arc<Self>,
        item: &ItemDescriptor,
        attempt: AttemptId,
        staging: &Path,
        outcome: Option<TransferOutcome>,
    ) {
        let Some(outcome) = outcome else {
            self.handle_download_failed(item, attempt, staging).await;
            return;
        };

        // Only the attempt that still owns the item may finalize it.
        let owns = {
            let mut items = self.items.lock();
            match items.get_mut(&item.id) {
                Some(entry) => match entry.actual {
                    DownloadState::Downloading {
                        attempt: current, ..
                    } if current == attempt => {
                        entry.actual = DownloadState::Finalizing {
                            progress: 1.0,
                            attempt,
                        };
                        entry.active = None;
                        true
                    }
                    _ => false,
                },
                None => false,
            }
        };
        if !owns {
            debug!(item = %item.id, "completion from a superseded attempt dropped");
            return;
        }
        self.notify(&item.id);

        if let (Some(expected), Some(actual)) =
            (item.expected_hash.as_deref(), outcome.content_hash.as_deref())
        {
            if !expected.eq_ignore_ascii_case(actual) {
                // Kept lenient: the artifact is still placed and recorded.
                error!(
                    item = %item.id,
                    expected,
                    actual,
                    "content hash mismatch on completed transfer"
                );
            }
        }

        let final_path = self.layout.final_path(item);
        match self.store.rename(&outcome.temp_path, &final_path).await {
            Ok(()) => {
                {
                    let mut items = self.items.lock();
                    if let Some(entry) = items.get_mut(&item.id) {
                        entry.actual = DownloadState::Downloaded {
                            uri: final_path,
                            hash: outcome.content_hash,
                        };
                    }
                }
                self.notify(&item.id);
                info!(item = %item.id, "download complete");

                let latest = self.requested_state(&item.id);
                self.transition(item, latest);
            }
            Err(err) => {
                warn!(item = %item.id, error = %err, "failed to move artifact into place");
                self.handle_download_failed(item, attempt, staging).await;
            }
        }
    }

    /// Shared failure path for a broken transfer or a failed finalize.
    ///
    /// Cleans up the staging file best-effort, degrades the item to
    /// `NotDownloaded`, and re-evaluates the latest request — unless that
    /// request is still `Downloaded`, in which case the failure is terminal
    /// until the caller asks again.
    async fn handle_download_failed(
        self: &Arc<Self>,
        item: &ItemDescriptor,
        attempt: AttemptId,
        staging: &Path,
    ) {
        let owns = {
            let mut items = self.items.lock();
            match items.get_mut(&item.id) {
                Some(entry) => match entry.actual {
                    DownloadState::Downloading {
                        attempt: current, ..
                    }
                    | DownloadState::Finalizing {
                        attempt: current, ..
                    } if current == attempt => {
                        entry.active = None;
                        true
                    }
                    _ => false,
                },
                None => false,
            }
        };
        if !owns {
            debug!(item = %item.id, "failure from a superseded attempt dropped");
            return;
        }

        if let Err(err) = self.store.remove(staging).await {
            warn!(item = %item.id, error = %err, "failed to remove staging file");
        }

        let changed = {
            let mut items = self.items.lock();
            match items.get_mut(&item.id) {
                Some(entry) => match entry.actual {
                    DownloadState::Downloading {
                        attempt: current, ..
                    }
                    | DownloadState::Finalizing {
                        attempt: current, ..
                    } if current == attempt => {
                        entry.actual = DownloadState::NotDownloaded;
                        true
                    }
                    _ => false,
                },
                None => false,
            }
        };
        if !changed {
            return;
        }
        self.notify(&item.id);

        let latest = self.requested_state(&item.id);
        if latest != RequestedState::Downloaded {
            self.transition(item, latest);
        } else {
            info!(item = %item.id, "download failed; waiting for a new request before retrying");
        }
    }

    // =========================================================================
    // Cancel
    // =========================================================================

    fn begin_cancel(self: &Arc<Self>, item: &ItemDescriptor) {
        let (snapshot, task) = {
            let mut items = self.items.lock();
            let Some(entry) = items.get_mut(&item.id) else {
                return;
            };
            let (progress, attempt) = match &entry.actual {
                DownloadState::Downloading { progress, attempt } => (*progress, *attempt),
                _ => {
                    debug!(item = %item.id, "cancel skipped; nothing in flight");
                    return;
                }
            };
            let snapshot = entry.actual.clone();
            let task = entry
                .active
                .as_ref()
                .filter(|active| active.attempt == attempt)
                .map(|active| Arc::clone(&active.task));
            entry.actual = DownloadState::Cancelling { progress };
            (snapshot, task)
        };
        self.notify(&item.id);

        let manager = Arc::clone(self);
        let item = item.clone();
        let staging = self.layout.staging_path(&item);
        tokio::spawn(async move {
            let result = match &task {
                Some(task) => task.cancel().await,
                // The transfer ended on its own before the cancel reached it.
                None => Ok(()),
            };
            match result {
                Ok(()) => {
                    if let Err(err) = manager.store.remove(&staging).await {
                        warn!(item = %item.id, error = %err, "failed to remove staging file");
                    }
                    {
                        let mut items = manager.items.lock();
                        if let Some(entry) = items.get_mut(&item.id) {
                            if matches!(entry.actual, DownloadState::Cancelling { .. }) {
                                entry.actual = DownloadState::NotDownloaded;
                                entry.active = None;
                            }
                        }
                    }
                    manager.notify(&item.id);
                    info!(item = %item.id, "download cancelled");
                }
                Err(err) => {
                    warn!(item = %item.id, error = %err, "cancel failed; restoring previous state");
                    {
                        let mut items = manager.items.lock();
                        if let Some(entry) = items.get_mut(&item.id) {
                            if matches!(entry.actual, DownloadState::Cancelling { .. }) {
                                entry.actual = snapshot.clone();
                            }
                        }
                    }
                    manager.notify(&item.id);
                }
            }

            // Hand off to a fresh evaluation of the latest intent: a
            // still-standing removal request retries the cancel, a reversed
            // one restarts or no-ops against the restored state.
            let latest = manager.requested_state(&item.id);
            manager.transition(&item, latest);
        });
    }

    // =========================================================================
    // Delete
    // =========================================================================

    fn begin_delete(self: &Arc<Self>, item: &ItemDescriptor) {
        let (snapshot, uri) = {
            let mut items = self.items.lock();
            let Some(entry) = items.get_mut(&item.id) else {
                return;
            };
            let uri = match &entry.actual {
                DownloadState::Downloaded { uri, .. } => uri.clone(),
                _ => {
                    debug!(item = %item.id, "delete skipped; no finalized artifact");
                    return;
                }
            };
            let snapshot = entry.actual.clone();
            entry.actual = DownloadState::Deleting;
            (snapshot, uri)
        };
        self.notify(&item.id);

        let manager = Arc::clone(self);
        let item = item.clone();
        tokio::spawn(async move {
            match manager.store.remove(&uri).await {
                Ok(()) => {
                    {
                        let mut items = manager.items.lock();
                        if let Some(entry) = items.get_mut(&item.id) {
                            if matches!(entry.actual, DownloadState::Deleting) {
                                entry.actual = DownloadState::NotDownloaded;
                            }
                        }
                    }
                    manager.notify(&item.id);
                    info!(item = %item.id, "artifact deleted");
                }
                Err(err) => {
                    warn!(item = %item.id, error = %err, "delete failed; restoring previous state");
                    {
                        let mut items = manager.items.lock();
                        if let Some(entry) = items.get_mut(&item.id) {
                            if matches!(entry.actual, DownloadState::Deleting) {
                                entry.actual = snapshot.clone();
                            }
                        }
                    }
                    manager.notify(&item.id);
                }
            }

            let latest = manager.requested_state(&item.id);
            manager.transition(&item, latest);
        });
    }
}

/// The fixed transition table: what one reconciliation step may start.
fn plan(actual: &DownloadState, target: RequestedState, id: &ItemId) -> Option<PlannedOp> {
    use DownloadState as A;
    use RequestedState as R;

    match (actual, target) {
        (_, R::None) => None,
        (A::Unknown, _) => {
            warn!(item = %id, "cannot act on an item whose presence is unknown");
            None
        }
        (A::Downloaded { .. }, R::NotDownloaded) => Some(PlannedOp::Delete),
        (A::Downloaded { .. }, R::Downloaded) => None,
        (A::NotDownloaded | A::FailedDownloading, R::Downloaded) => Some(PlannedOp::StartDownload),
        (A::NotDownloaded | A::FailedDownloading, R::NotDownloaded) => None,
        (A::Downloading { .. }, R::NotDownloaded) => Some(PlannedOp::Cancel),
        (A::Downloading { .. } | A::Finalizing { .. }, R::Downloaded) => None,
        // The move is the one operation in flight; the removal intent is
        // honored by the re-evaluation that runs when it completes.
        (A::Finalizing { .. }, R::NotDownloaded) => None,
        (A::Cancelling { .. } | A::Deleting, _) => None,
    }
}

/// Guard returned by [`DownloadManager::subscribe`]; removes the callback on
/// drop.
pub struct Subscription {
    manager: Weak<DownloadManager>,
    id: ItemId,
    token: u64,
}

impl Subscription {
    /// Remove the callback now instead of at drop time.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            let mut items = manager.items.lock();
            if let Some(entry) = items.get_mut(&self.id) {
                entry.subscribers.retain(|(token, _)| *token != self.token);
            }
        }
    }
}
