//! End-position watchers: a subscription that fires, edge-triggered, when a
//! stream's durable end advances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;

struct Subscription {
    latest: AtomicI64,
    wake: Sender<()>,
}

/// Registry of all subscriptions, indexed by stream id. The committer
/// calls [`Self::notify`] after every successful apply.
#[derive(Default)]
pub struct EndWatchers {
    subs: RwLock<HashMap<i64, Vec<Arc<Subscription>>>>,
}

impl EndWatchers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, stream_id: i64) -> Watcher {
        let (wake, rx) = crossbeam_channel::bounded(1);
        let sub = Arc::new(Subscription {
            latest: AtomicI64::new(-1),
            wake,
        });
        self.subs.write().entry(stream_id).or_default().push(sub.clone());
        Watcher {
            owner: self.clone(),
            stream_id,
            sub,
            rx,
            closed: false,
        }
    }

    /// Record the new end offset for `stream_id` and wake every watcher.
    ///
    /// Delivery is best-effort: a watcher that has not yet consumed a prior
    /// wake simply has its `latest` value overwritten; it will observe the
    /// newest offset, not an intermediate one, on its next `watch()` call.
    pub fn notify(&self, stream_id: i64, offset: i64) {
        if let Some(list) = self.subs.read().get(&stream_id) {
            for sub in list {
                sub.latest.store(offset, Ordering::Release);
                let _ = sub.wake.try_send(());
            }
        }
    }
}

/// A single subscription to a stream's end-offset changes.
pub struct Watcher {
    owner: Arc<EndWatchers>,
    stream_id: i64,
    sub: Arc<Subscription>,
    rx: Receiver<()>,
    closed: bool,
}

impl Watcher {
    /// Block until the stream's durable end has advanced since the last
    /// call (or since subscription, for the first call), then return the
    /// new end offset.
    pub fn watch(&self) -> Option<i64> {
        self.rx.recv().ok()?;
        Some(self.sub.latest.load(Ordering::Acquire))
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(list) = self.owner.subs.write().get_mut(&self.stream_id) {
            list.retain(|s| !Arc::ptr_eq(s, &self.sub));
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// The dedicated watcher-notifier thread.
///
/// The committer posts `(stream_id, new_end)` pairs here rather than calling
/// [`EndWatchers::notify`] directly, so a subscriber-heavy stream can never
/// add latency to the commit path itself.
pub struct Notifier {
    tx: Sender<(i64, i64)>,
    handle: Option<JoinHandle<()>>,
}

impl Notifier {
    pub fn spawn(watchers: Arc<EndWatchers>) -> Self {
        let (tx, rx): (Sender<(i64, i64)>, Receiver<(i64, i64)>) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("streamlog-watcher-notifier".into())
            .spawn(move || {
                for (stream_id, offset) in rx {
                    watchers.notify(stream_id, offset);
                }
            })
            .expect("failed to spawn watcher notifier thread");
        Self { tx, handle: Some(handle) }
    }

    pub fn notify(&self, stream_id: i64, offset: i64) {
        let _ = self.tx.send((stream_id, offset));
    }

    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            let (tx, _rx) = crossbeam_channel::unbounded();
            self.tx = tx;
            let _ = handle.join();
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.close();
    }
}
