//! A bounded FIFO supporting batched `take()` and backpressured `put()`,
//! used for the caller -> journal-writer and journal-writer -> committer
//! queues.

use crossbeam_channel::{Receiver, Sender};

use crate::entry::Entry;

/// Bounded queue of [`Entry`] values.
///
/// `put`/`put_entries` block when the queue is full (backpressure); `take`
/// drains everything currently available, blocking only if the queue is
/// empty.
pub struct EntryQueue {
    tx: Sender<Entry>,
    rx: Receiver<Entry>,
}

impl EntryQueue {
    pub fn bounded(cap: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(cap.max(1));
        Self { tx, rx }
    }

    pub fn put(&self, entry: Entry) {
        // The only way `send` fails is if every receiver has been dropped,
        // which only happens once the store is fully shut down; there is
        // nothing useful to do with the entry at that point but drop it.
        let _ = self.tx.send(entry);
    }

    pub fn put_entries(&self, entries: Vec<Entry>) {
        for entry in entries {
            self.put(entry);
        }
    }

    /// Block until at least one entry is available, then drain every entry
    /// currently queued.
    pub fn take(&self) -> Vec<Entry> {
        let mut batch = Vec::new();
        match self.rx.recv() {
            Ok(entry) => batch.push(entry),
            Err(_) => return batch,
        }
        while let Ok(entry) = self.rx.try_recv() {
            batch.push(entry);
        }
        batch
    }

    pub fn sender(&self) -> Sender<Entry> {
        self.tx.clone()
    }
}
