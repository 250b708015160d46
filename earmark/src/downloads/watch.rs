//! Bindings between the lifecycle manager and a reactive UI layer.
//!
//! A watcher ties one item (or a group of items) to a re-render trigger: it
//! subscribes on attach, resolves unknown states, forwards notifications to
//! the trigger while alive, and guarantees the trigger never fires again
//! after the watcher is dropped — a view that unmounted must not be poked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::aggregate::{aggregate, GroupSnapshot};
use super::item::ItemDescriptor;
use super::manager::{DownloadManager, Subscription};
use super::state::{DownloadState, RequestedState, TogglePlan};

/// Binds a single item's lifecycle to a change trigger.
pub struct ItemWatcher {
    manager: Arc<DownloadManager>,
    item: ItemDescriptor,
    live: Arc<AtomicBool>,
    _subscription: Subscription,
}

impl ItemWatcher {
    /// Subscribe to the item and resolve its state if still unknown.
    ///
    /// `on_change` runs on every state mutation of the item until the
    /// watcher is dropped.
    pub fn attach(
        manager: Arc<DownloadManager>,
        item: ItemDescriptor,
        on_change: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let live = Arc::new(AtomicBool::new(true));
        let callback = {
            let live = Arc::clone(&live);
            move || {
                if live.load(Ordering::SeqCst) {
                    on_change();
                }
            }
        };
        let subscription = manager.subscribe(&item.id, callback);
        manager.ensure_known(&item);

        Self {
            manager,
            item,
            live,
            _subscription: subscription,
        }
    }

    /// The watched item.
    pub fn item(&self) -> &ItemDescriptor {
        &self.item
    }

    /// Current actual state.
    pub fn state(&self) -> DownloadState {
        self.manager.actual_state(&self.item.id)
    }

    /// Current standing request.
    pub fn requested(&self) -> RequestedState {
        self.manager.requested_state(&self.item.id)
    }

    /// What a single control press would do right now.
    pub fn plan(&self) -> TogglePlan {
        self.manager.toggle_plan(&self.item.id)
    }

    /// Whether the standing request contradicts the actual state.
    pub fn unsatisfied(&self) -> bool {
        self.manager.has_unsatisfied_request(&self.item.id)
    }

    /// Press the one-button control: record the natural next intent.
    pub fn toggle(&self) {
        let plan = self.plan();
        self.manager.transition(&self.item, plan.target);
    }

    /// Request the item on device.
    pub fn start(&self) {
        self.manager.transition(&self.item, RequestedState::Downloaded);
    }

    /// Request the item off device; the manager picks cancel or delete from
    /// the actual state.
    pub fn discard(&self) {
        self.manager
            .transition(&self.item, RequestedState::NotDownloaded);
    }
}

impl Drop for ItemWatcher {
    fn drop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Binds a group of items to one change trigger and one composite control.
pub struct GroupWatcher {
    manager: Arc<DownloadManager>,
    items: Vec<ItemDescriptor>,
    live: Arc<AtomicBool>,
    _subscriptions: Vec<Subscription>,
}

impl GroupWatcher {
    /// Subscribe to every member and resolve unknown states.
    pub fn attach(
        manager: Arc<DownloadManager>,
        items: Vec<ItemDescriptor>,
        on_change: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let live = Arc::new(AtomicBool::new(true));
        let on_change: Arc<dyn Fn() + Send + Sync> = Arc::new(on_change);

        let subscriptions = items
            .iter()
            .map(|item| {
                let live = Arc::clone(&live);
                let on_change = Arc::clone(&on_change);
                let subscription = manager.subscribe(&item.id, move || {
                    if live.load(Ordering::SeqCst) {
                        on_change();
                    }
                });
                manager.ensure_known(item);
                subscription
            })
            .collect();

        Self {
            manager,
            items,
            live,
            _subscriptions: subscriptions,
        }
    }

    /// The watched items, in attach order.
    pub fn items(&self) -> &[ItemDescriptor] {
        &self.items
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Composite state and action over the members' current states.
    pub fn snapshot(&self) -> GroupSnapshot {
        let states: Vec<DownloadState> = self
            .items
            .iter()
            .map(|item| self.manager.actual_state(&item.id))
            .collect();
        aggregate(&states)
    }

    /// Press the composite control.
    ///
    /// The composite action is applied only to members whose own next action
    /// matches it, so a group "start" never re-requests a member that is
    /// already on device.
    pub fn apply(&self) {
        let Some(action) = self.snapshot().action else {
            return;
        };
        for item in &self.items {
            let plan = self.manager.toggle_plan(&item.id);
            if plan.action == action {
                self.manager.transition(item, plan.target);
            }
        }
    }
}

impl Drop for GroupWatcher {
    fn drop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
    }
}
