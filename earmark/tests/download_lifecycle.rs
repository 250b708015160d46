//! Integration tests for the download lifecycle manager.
//!
//! These tests drive the complete reconciliation flow with a scripted
//! in-memory transfer client and content store:
//! - requested/actual convergence under rapid toggling
//! - stale-attempt progress and completion filtering
//! - rollback on failed cancel/delete, with automatic retry
//! - group aggregation and selective group actions
//!
//! Run with: `cargo test --test download_lifecycle`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use earmark::downloads::{
    BoxFuture, ContentStore, DownloadAction, DownloadManager, DownloadState, GroupState,
    GroupWatcher, ItemDescriptor, ItemId, Probe, ProgressSink, RequestedState, StorageLayout,
    StoreError, Subscription, TransferClient, TransferError, TransferOutcome, TransferRequest,
    TransferTask,
};

/// SHA-256-looking fixture hash.
const FIXTURE_HASH: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

// ============================================================================
// Scripted transfer client
// ============================================================================

/// Transfer client that records every attempt and lets the test drive it.
#[derive(Default)]
struct FakeTransfer {
    attempts: Mutex<Vec<Arc<ScriptedTask>>>,
}

impl FakeTransfer {
    fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    fn attempt(&self, index: usize) -> Arc<ScriptedTask> {
        Arc::clone(&self.attempts.lock()[index])
    }

    fn latest(&self) -> Arc<ScriptedTask> {
        let attempts = self.attempts.lock();
        Arc::clone(attempts.last().expect("no transfer attempt was begun"))
    }
}

impl TransferClient for FakeTransfer {
    fn begin(&self, request: TransferRequest, on_progress: ProgressSink) -> Arc<dyn TransferTask> {
        let task = Arc::new(ScriptedTask {
            request,
            progress: on_progress,
            outcome: Mutex::new(None),
            done: Notify::new(),
            cancelled: AtomicBool::new(false),
            cancel_failures: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        });
        self.attempts.lock().push(Arc::clone(&task));
        task
    }
}

/// One scripted transfer attempt.
struct ScriptedTask {
    request: TransferRequest,
    progress: ProgressSink,
    outcome: Mutex<Option<Option<TransferOutcome>>>,
    done: Notify,
    cancelled: AtomicBool,
    cancel_failures: AtomicUsize,
    cancel_calls: AtomicUsize,
}

impl ScriptedTask {
    /// Emit a progress fraction as the transfer primitive would.
    fn emit_progress(&self, fraction: f64) {
        (self.progress)(fraction);
    }

    /// Complete successfully with the given content hash.
    fn succeed(&self, hash: &str) {
        *self.outcome.lock() = Some(Some(TransferOutcome {
            temp_path: self.request.destination.clone(),
            content_hash: Some(hash.to_string()),
            http_status: 200,
        }));
        self.done.notify_waiters();
    }

    /// End without a usable result.
    fn fail(&self) {
        *self.outcome.lock() = Some(None);
        self.done.notify_waiters();
    }

    /// Make the next `n` cancel calls fail.
    fn fail_next_cancels(&self, n: usize) {
        self.cancel_failures.store(n, Ordering::SeqCst);
    }

    fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

impl TransferTask for ScriptedTask {
    fn cancel(&self) -> BoxFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            if self.cancel_failures.load(Ordering::SeqCst) > 0 {
                self.cancel_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TransferError::NotCancellable);
            }
            self.cancelled.store(true, Ordering::SeqCst);
            self.done.notify_waiters();
            Ok(())
        })
    }

    fn join(&self) -> BoxFuture<'_, Option<TransferOutcome>> {
        Box::pin(async move {
            loop {
                let notified = self.done.notified();
                if let Some(outcome) = self.outcome.lock().take() {
                    return outcome;
                }
                if self.cancelled.load(Ordering::SeqCst) {
                    return None;
                }
                notified.await;
            }
        })
    }
}

// ============================================================================
// Scripted content store
// ============================================================================

/// In-memory content store with failure injection.
#[derive(Default)]
struct MemoryStore {
    files: Mutex<HashMap<PathBuf, Option<String>>>,
    probe_calls: AtomicUsize,
    remove_calls: Mutex<Vec<PathBuf>>,
    fail_probes: AtomicUsize,
    fail_renames: AtomicUsize,
    fail_removes: AtomicUsize,
    renames_held: AtomicBool,
    rename_release: Notify,
}

impl MemoryStore {
    fn seed(&self, path: PathBuf, hash: &str) {
        self.files.lock().insert(path, Some(hash.to_string()));
    }

    fn contains(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    fn removes_of(&self, path: &Path) -> usize {
        self.remove_calls
            .lock()
            .iter()
            .filter(|removed| removed.as_path() == path)
            .count()
    }

    fn fail_next_probes(&self, n: usize) {
        self.fail_probes.store(n, Ordering::SeqCst);
    }

    fn fail_next_renames(&self, n: usize) {
        self.fail_renames.store(n, Ordering::SeqCst);
    }

    fn fail_next_removes(&self, n: usize) {
        self.fail_removes.store(n, Ordering::SeqCst);
    }

    /// Make renames block until released.
    fn hold_renames(&self) {
        self.renames_held.store(true, Ordering::SeqCst);
    }

    fn release_renames(&self) {
        self.renames_held.store(false, Ordering::SeqCst);
        self.rename_release.notify_waiters();
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    if counter.load(Ordering::SeqCst) > 0 {
        counter.fetch_sub(1, Ordering::SeqCst);
        true
    } else {
        false
    }
}

fn scripted_io_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "scripted failure")
}

impl ContentStore for MemoryStore {
    fn probe(&self, path: &Path) -> BoxFuture<'_, Result<Probe, StoreError>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.fail_probes) {
                return Err(StoreError::Read {
                    path,
                    source: scripted_io_error(),
                });
            }
            let files = self.files.lock();
            match files.get(&path) {
                Some(hash) => Ok(Probe {
                    exists: true,
                    hash: hash.clone(),
                }),
                None => Ok(Probe {
                    exists: false,
                    hash: None,
                }),
            }
        })
    }

    fn rename(&self, from: &Path, to: &Path) -> BoxFuture<'_, Result<(), StoreError>> {
        let from = from.to_path_buf();
        let to = to.to_path_buf();
        Box::pin(async move {
            while self.renames_held.load(Ordering::SeqCst) {
                let released = self.rename_release.notified();
                if !self.renames_held.load(Ordering::SeqCst) {
                    break;
                }
                released.await;
            }
            if take_one(&self.fail_renames) {
                return Err(StoreError::Move {
                    from,
                    to,
                    source: scripted_io_error(),
                });
            }
            let mut files = self.files.lock();
            let hash = files.remove(&from).flatten();
            files.insert(to, hash);
            Ok(())
        })
    }

    fn remove(&self, path: &Path) -> BoxFuture<'_, Result<(), StoreError>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            self.remove_calls.lock().push(path.clone());
            if take_one(&self.fail_removes) {
                return Err(StoreError::Delete {
                    path,
                    source: scripted_io_error(),
                });
            }
            self.files.lock().remove(&path);
            Ok(())
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    manager: Arc<DownloadManager>,
    transfer: Arc<FakeTransfer>,
    store: Arc<MemoryStore>,
    layout: StorageLayout,
}

fn harness() -> Harness {
    let transfer = Arc::new(FakeTransfer::default());
    let store = Arc::new(MemoryStore::default());
    let layout = StorageLayout::new("/library").with_staging_dir("/staging");
    let manager = DownloadManager::new(
        Arc::clone(&transfer) as Arc<dyn TransferClient>,
        Arc::clone(&store) as Arc<dyn ContentStore>,
        layout.clone(),
    );
    Harness {
        manager,
        transfer,
        store,
        layout,
    }
}

fn item(id: &str) -> ItemDescriptor {
    ItemDescriptor::new(
        id,
        format!("https://cdn.example.com/{id}.mp3"),
        "mp3",
    )
}

/// Give spawned reconciliation steps time to run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Resolve an item to `NotDownloaded` via the attach-time probe.
async fn probed_absent(harness: &Harness, item: &ItemDescriptor) {
    harness.manager.ensure_known(item);
    settle().await;
    assert_eq!(
        harness.manager.actual_state(&item.id),
        DownloadState::NotDownloaded
    );
}

/// Record every notified state of an item.
fn record_states(
    manager: &Arc<DownloadManager>,
    id: &ItemId,
) -> (Subscription, Arc<Mutex<Vec<DownloadState>>>) {
    let states = Arc::new(Mutex::new(Vec::new()));
    let weak = Arc::downgrade(manager);
    let watched = id.clone();
    let sink = Arc::clone(&states);
    let subscription = manager.subscribe(id, move || {
        if let Some(manager) = weak.upgrade() {
            sink.lock().push(manager.actual_state(&watched));
        }
    });
    (subscription, states)
}

/// Short readable label for sequence assertions.
fn label(state: &DownloadState) -> String {
    match state {
        DownloadState::Unknown => "unknown".to_string(),
        DownloadState::NotDownloaded => "not_downloaded".to_string(),
        DownloadState::Downloading { progress, .. } => format!("downloading:{progress:.2}"),
        DownloadState::Finalizing { .. } => "finalizing".to_string(),
        DownloadState::Cancelling { progress } => format!("cancelling:{progress:.2}"),
        DownloadState::Deleting => "deleting".to_string(),
        DownloadState::FailedDownloading => "failed".to_string(),
        DownloadState::Downloaded { .. } => "downloaded".to_string(),
    }
}

fn labels(states: &[DownloadState]) -> Vec<String> {
    states.iter().map(label).collect()
}

fn dedup(labels: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for label in labels {
        if out.last() != Some(&label) {
            out.push(label);
        }
    }
    out
}

// ============================================================================
// Lifecycle scenarios
// ============================================================================

#[tokio::test]
async fn test_download_happy_path_state_sequence() {
    let h = harness();
    let item = item("lesson-1");
    let (_subscription, states) = record_states(&h.manager, &item.id);

    probed_absent(&h, &item).await;
    h.manager.transition(&item, RequestedState::Downloaded);

    assert_eq!(h.transfer.attempt_count(), 1);
    let task = h.transfer.latest();
    assert_eq!(task.request.destination, h.layout.staging_path(&item));
    assert!(task.request.verify_hash);

    task.emit_progress(0.3);
    task.emit_progress(0.7);
    task.succeed(FIXTURE_HASH);
    settle().await;

    let final_path = h.layout.final_path(&item);
    assert_eq!(
        h.manager.actual_state(&item.id),
        DownloadState::Downloaded {
            uri: final_path.clone(),
            hash: Some(FIXTURE_HASH.to_string()),
        }
    );
    assert!(h.store.contains(&final_path));

    let recorded = labels(&states.lock());
    assert_eq!(
        dedup(recorded.clone()),
        vec![
            "not_downloaded",
            "downloading:0.00",
            "downloading:0.30",
            "downloading:0.70",
            "finalizing",
            "downloaded",
        ]
    );
    // One notification per intermediate state, no duplicates.
    for intermediate in ["downloading:0.30", "downloading:0.70", "finalizing"] {
        assert_eq!(
            recorded.iter().filter(|l| l.as_str() == intermediate).count(),
            1,
            "expected exactly one {intermediate} notification"
        );
    }
}

#[tokio::test]
async fn test_stale_attempt_progress_is_ignored() {
    let h = harness();
    let item = item("lesson-1");

    probed_absent(&h, &item).await;
    h.manager.transition(&item, RequestedState::Downloaded);
    let first = h.transfer.attempt(0);
    first.emit_progress(0.5);

    h.manager.transition(&item, RequestedState::NotDownloaded);
    settle().await;
    assert_eq!(h.manager.actual_state(&item.id), DownloadState::NotDownloaded);

    h.manager.transition(&item, RequestedState::Downloaded);
    assert_eq!(h.transfer.attempt_count(), 2);
    let second = h.transfer.attempt(1);

    // A signal captured from the superseded attempt must be a no-op.
    first.emit_progress(0.9);
    match h.manager.actual_state(&item.id) {
        DownloadState::Downloading { progress, .. } => assert_eq!(progress, 0.0),
        other => panic!("expected the new attempt to be downloading, got {other:?}"),
    }

    // The live attempt still applies.
    second.emit_progress(0.6);
    match h.manager.actual_state(&item.id) {
        DownloadState::Downloading { progress, .. } => assert_eq!(progress, 0.6),
        other => panic!("expected downloading, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_failure_rolls_back_and_retries() {
    let h = harness();
    let item = item("lesson-1");
    let (_subscription, states) = record_states(&h.manager, &item.id);

    probed_absent(&h, &item).await;
    h.manager.transition(&item, RequestedState::Downloaded);
    let task = h.transfer.latest();
    task.emit_progress(0.5);
    let before_cancel = h.manager.actual_state(&item.id);

    task.fail_next_cancels(1);
    h.manager.transition(&item, RequestedState::NotDownloaded);
    settle().await;

    // First cancel failed and rolled back to the exact pre-cancel state;
    // the standing removal request retried automatically and succeeded.
    assert_eq!(task.cancel_calls(), 2);
    assert_eq!(h.manager.actual_state(&item.id), DownloadState::NotDownloaded);

    let recorded = states.lock().clone();
    // Every mid-flight notification carries the exact pre-cancel snapshot:
    // the rollback restored progress and attempt identity, not a lookalike.
    for state in recorded.iter() {
        if label(state) == "downloading:0.50" {
            assert_eq!(state, &before_cancel);
        }
    }
    assert_eq!(
        dedup(labels(&recorded)),
        vec![
            "not_downloaded",
            "downloading:0.00",
            "downloading:0.50",
            "cancelling:0.50",
            "downloading:0.50",
            "cancelling:0.50",
            "not_downloaded",
        ]
    );
}

#[tokio::test]
async fn test_delete_failure_rolls_back_and_retries() {
    let h = harness();
    let item = item("lesson-1");
    let final_path = h.layout.final_path(&item);
    h.store.seed(final_path.clone(), FIXTURE_HASH);

    h.manager.ensure_known(&item);
    settle().await;
    let downloaded = h.manager.actual_state(&item.id);
    assert!(matches!(downloaded, DownloadState::Downloaded { .. }));

    h.store.fail_next_removes(1);
    let (_subscription, states) = record_states(&h.manager, &item.id);
    h.manager.transition(&item, RequestedState::NotDownloaded);
    settle().await;

    assert_eq!(h.manager.actual_state(&item.id), DownloadState::NotDownloaded);
    assert_eq!(h.store.removes_of(&final_path), 2);
    assert!(!h.store.contains(&final_path));

    let recorded = states.lock().clone();
    assert!(
        recorded.iter().any(|state| *state == downloaded),
        "rollback must restore the exact pre-delete snapshot"
    );
    assert_eq!(
        dedup(labels(&recorded)),
        vec![
            "downloaded",
            "deleting",
            "downloaded",
            "deleting",
            "not_downloaded",
        ]
    );
}

#[tokio::test]
async fn test_download_failure_is_terminal_until_rerequested() {
    let h = harness();
    let item = item("lesson-1");

    probed_absent(&h, &item).await;
    h.manager.transition(&item, RequestedState::Downloaded);
    h.transfer.latest().fail();
    settle().await;

    assert_eq!(h.manager.actual_state(&item.id), DownloadState::NotDownloaded);
    assert_eq!(h.manager.requested_state(&item.id), RequestedState::Downloaded);
    assert!(h.manager.has_unsatisfied_request(&item.id));
    assert_eq!(h.transfer.attempt_count(), 1, "a failed download must not auto-retry");
    assert_eq!(h.store.removes_of(&h.layout.staging_path(&item)), 1);

    // An explicit re-request starts a fresh attempt.
    h.manager.transition(&item, RequestedState::Downloaded);
    assert_eq!(h.transfer.attempt_count(), 2);
}

#[tokio::test]
async fn test_move_failure_degrades_to_not_downloaded() {
    let h = harness();
    let item = item("lesson-1");

    probed_absent(&h, &item).await;
    h.store.fail_next_renames(1);
    h.manager.transition(&item, RequestedState::Downloaded);
    h.transfer.latest().succeed(FIXTURE_HASH);
    settle().await;

    assert_eq!(h.manager.actual_state(&item.id), DownloadState::NotDownloaded);
    assert_eq!(h.transfer.attempt_count(), 1);
    assert_eq!(h.store.removes_of(&h.layout.staging_path(&item)), 1);
    assert!(!h.store.contains(&h.layout.final_path(&item)));
}

#[tokio::test]
async fn test_discard_during_finalizing_queues_delete() {
    let h = harness();
    let item = item("lesson-1");
    let (_subscription, states) = record_states(&h.manager, &item.id);

    probed_absent(&h, &item).await;
    h.store.hold_renames();
    h.manager.transition(&item, RequestedState::Downloaded);
    h.transfer.latest().succeed(FIXTURE_HASH);
    settle().await;
    assert!(matches!(
        h.manager.actual_state(&item.id),
        DownloadState::Finalizing { .. }
    ));

    // The listener changes their mind while the artifact is being moved.
    h.manager.transition(&item, RequestedState::NotDownloaded);
    assert!(matches!(
        h.manager.actual_state(&item.id),
        DownloadState::Finalizing { .. }
    ));

    h.store.release_renames();
    settle().await;

    assert_eq!(h.manager.actual_state(&item.id), DownloadState::NotDownloaded);
    assert!(!h.store.contains(&h.layout.final_path(&item)));

    let recorded = dedup(labels(&states.lock()));
    let tail: Vec<&str> = recorded.iter().rev().take(3).rev().map(String::as_str).collect();
    assert_eq!(tail, vec!["downloaded", "deleting", "not_downloaded"]);
}

#[tokio::test]
async fn test_toggle_storm_converges_to_last_request() {
    let h = harness();
    let item = item("lesson-1");

    probed_absent(&h, &item).await;
    h.manager.transition(&item, RequestedState::Downloaded);
    h.manager.transition(&item, RequestedState::NotDownloaded);
    h.manager.transition(&item, RequestedState::Downloaded);
    settle().await;

    // The first attempt was cancelled; its completion handed off to a fresh
    // evaluation, which started a second attempt for the standing request.
    assert_eq!(h.transfer.attempt_count(), 2);
    assert!(matches!(
        h.manager.actual_state(&item.id),
        DownloadState::Downloading { .. }
    ));

    h.transfer.latest().succeed(FIXTURE_HASH);
    settle().await;

    assert!(matches!(
        h.manager.actual_state(&item.id),
        DownloadState::Downloaded { .. }
    ));
    assert!(!h.manager.has_unsatisfied_request(&item.id));
}

#[tokio::test]
async fn test_toggle_storm_ending_not_downloaded() {
    let h = harness();
    let item = item("lesson-1");

    probed_absent(&h, &item).await;
    h.manager.transition(&item, RequestedState::Downloaded);
    h.manager.transition(&item, RequestedState::NotDownloaded);
    settle().await;

    assert_eq!(h.manager.actual_state(&item.id), DownloadState::NotDownloaded);
    assert_eq!(h.transfer.attempt_count(), 1);
    assert!(!h.manager.has_unsatisfied_request(&item.id));
}

// ============================================================================
// Existence probes
// ============================================================================

#[tokio::test]
async fn test_probe_failure_leaves_unknown_and_retries_on_next_call() {
    let h = harness();
    let item = item("lesson-1");

    h.store.fail_next_probes(1);
    h.manager.ensure_known(&item);
    settle().await;
    assert_eq!(h.manager.actual_state(&item.id), DownloadState::Unknown);
    assert_eq!(h.store.probe_calls(), 1);

    h.manager.ensure_known(&item);
    settle().await;
    assert_eq!(h.manager.actual_state(&item.id), DownloadState::NotDownloaded);
    assert_eq!(h.store.probe_calls(), 2);
}

#[tokio::test]
async fn test_concurrent_ensure_known_probes_once() {
    let h = harness();
    let item = item("lesson-1");

    h.manager.ensure_known(&item);
    h.manager.ensure_known(&item);
    settle().await;

    assert_eq!(h.store.probe_calls(), 1);
    assert_eq!(h.manager.actual_state(&item.id), DownloadState::NotDownloaded);

    // Already known; no further probes.
    h.manager.ensure_known(&item);
    settle().await;
    assert_eq!(h.store.probe_calls(), 1);
}

// ============================================================================
// Groups
// ============================================================================

#[tokio::test]
async fn test_group_action_applies_only_to_matching_members() {
    let h = harness();
    let members = vec![item("track-a"), item("track-b"), item("track-c")];
    h.store.seed(h.layout.final_path(&members[0]), FIXTURE_HASH);

    let group = GroupWatcher::attach(Arc::clone(&h.manager), members.clone(), || {});
    settle().await;

    let snapshot = group.snapshot();
    assert_eq!(
        snapshot.state,
        GroupState::NotDownloaded {
            progress: 1.0 / 3.0
        }
    );
    assert_eq!(snapshot.action, Some(DownloadAction::Start));

    group.apply();
    settle().await;

    // Only the two absent members start; the downloaded one is untouched.
    assert_eq!(h.transfer.attempt_count(), 2);
    assert!(matches!(
        h.manager.actual_state(&members[0].id),
        DownloadState::Downloaded { .. }
    ));
    assert_eq!(h.store.removes_of(&h.layout.final_path(&members[0])), 0);

    h.transfer.attempt(0).succeed(FIXTURE_HASH);
    h.transfer.attempt(1).succeed(FIXTURE_HASH);
    settle().await;

    let snapshot = group.snapshot();
    assert_eq!(snapshot.state, GroupState::Downloaded);
    assert_eq!(snapshot.action, Some(DownloadAction::Delete));
}
