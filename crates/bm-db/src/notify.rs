//! Deferred notification bus.
//!
//! Mirrors the original `DBConnector`'s `_start_operation`/`_end_operation`/
//! `notify`/`send_notification` design: store operations call [`Bus::notify`]
//! while they hold an open [`OperationGuard`], but delivery is deferred until
//! every in-flight operation's guard has been dropped. This keeps a
//! subscriber from observing "add-buildrequest" before the transaction that
//! produced it has actually committed, while also batching notifications
//! that land back-to-back.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};

/// Notification categories, matching the original's string categories
/// one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    AddChange,
    AddBuildset,
    AddBuildrequest,
    RetireBuildrequest,
    ModifyBuildset,
    AddBuild,
}

/// A single deferred notification: a category plus the row ids it concerns
/// (changeid, buildsetid, buildrequestid, etc., depending on category).
#[derive(Debug, Clone)]
pub struct Notification {
    pub category: Category,
    pub ids: Vec<i64>,
}

struct Inner {
    active: HashSet<u64>,
    pending: Vec<Notification>,
}

/// The notification bus. One instance lives inside each [`crate::connector::Connector`].
pub struct Bus {
    next_token: AtomicU64,
    state: Mutex<Inner>,
    dispatch: mpsc::UnboundedSender<Notification>,
    subscribers: broadcast::Sender<Notification>,
}

/// An open "in-flight operation" marker. Notifications queued while any
/// guard is outstanding are held back; they flush once the last guard for
/// the current wave is dropped.
pub struct OperationGuard {
    bus: Arc<Bus>,
    token: u64,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let bus = self.bus.clone();
        let token = self.token;
        tokio::spawn(async move {
            bus.end_operation(token).await;
        });
    }
}

impl Bus {
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let (sub_tx, _) = broadcast::channel(1024);
        let bus = Arc::new(Bus {
            next_token: AtomicU64::new(1),
            state: Mutex::new(Inner {
                active: HashSet::new(),
                pending: Vec::new(),
            }),
            dispatch: tx,
            subscribers: sub_tx.clone(),
        });

        // single serial dispatch task: every notification is broadcast from
        // here, never from the caller's own task.
        tokio::spawn(async move {
            while let Some(n) = rx.recv().await {
                let _ = sub_tx.send(n);
            }
        });

        bus
    }

    /// Marks the start of a store operation. Hold the returned guard for the
    /// duration of the operation's transaction; drop it when the operation
    /// has committed (or rolled back).
    pub async fn start_operation(self: &Arc<Self>) -> OperationGuard {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.state.lock().await.active.insert(token);
        OperationGuard {
            bus: self.clone(),
            token,
        }
    }

    async fn end_operation(&self, token: u64) {
        let mut state = self.state.lock().await;
        state.active.remove(&token);
        if !state.active.is_empty() {
            return;
        }
        for n in state.pending.drain(..) {
            let _ = self.dispatch.send(n);
        }
    }

    /// Queues a notification. It is held until no operation is in flight.
    pub async fn notify(&self, category: Category, ids: Vec<i64>) {
        let mut state = self.state.lock().await;
        state.pending.push(Notification { category, ids });
        if state.active.is_empty() {
            for n in state.pending.drain(..) {
                let _ = self.dispatch.send(n);
            }
        }
    }

    /// Subscribes to the bus. Notifications of every category arrive on the
    /// returned receiver; filter by [`Notification::category`] if only one
    /// kind is wanted.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.subscribers.subscribe()
    }

    /// True while at least one operation is in flight (has an outstanding
    /// [`OperationGuard`]).
    pub async fn has_pending_operations(&self) -> bool {
        !self.state.lock().await.active.is_empty()
    }
}
