//! Journal writer thread: the only thing that ever calls [`Journal::write`].
//!
//! Drains the caller-facing entry queue, appends each entry to the active
//! journal, `fsync`s the batch, and hands the durable batch on to the
//! committer. The journal's size is checked after every individual entry,
//! not once per batch, so a batch that straddles `max_wal_size` rotates
//! between two entries rather than landing entirely in an over-threshold
//! journal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Sender;
use log::{error, warn};

use crate::entry::Entry;
use crate::error::Error;
use crate::journal::Journal;
use crate::manifest::{Manifest, WalHeader};
use crate::queue::EntryQueue;

/// One durably-written batch, handed to the committer in submission order.
pub type CommitBatch = Vec<Entry>;

pub fn run(
    mut journal: Journal,
    manifest: Arc<Manifest>,
    wal_dir: PathBuf,
    max_wal_size: u64,
    queue: Arc<EntryQueue>,
    commit_tx: Sender<CommitBatch>,
) {
    'outer: loop {
        let batch = queue.take();
        if batch.is_empty() {
            // `take` only returns empty when every sender has been dropped.
            break;
        }

        let mut close_requested = false;
        let mut durable: CommitBatch = Vec::with_capacity(batch.len());
        for entry in batch {
            if entry.is_close_signal() {
                close_requested = true;
                continue;
            }
            match journal.write(&entry) {
                Ok(()) => durable.push(entry),
                Err(e) => {
                    error!("journal write failed: {e}");
                    (entry.callback)(-1, Err(e));
                }
            }

            // Checked after every entry (not once per batch) so a batch
            // that straddles the threshold rotates between entries, never
            // mid-entry: the entries written so far go to the old journal,
            // the rest of the batch goes to the new one.
            if journal.size() >= max_wal_size {
                if !flush_and_forward(&mut journal, &commit_tx, &mut durable) {
                    break 'outer;
                }
                if let Err(e) = rotate(&mut journal, &manifest, &wal_dir) {
                    warn!("journal rotation failed, will retry on next threshold check: {e}");
                }
            }
        }

        if !flush_and_forward(&mut journal, &commit_tx, &mut durable) {
            break;
        }

        if close_requested {
            let _ = commit_tx.send(vec![Entry::close_signal()]);
            break;
        }
    }
}

/// Flush whatever has been written to `journal` since the last flush and
/// forward it to the committer as one batch, in submission order.
///
/// Returns `false` if the commit channel is gone (the committer has shut
/// down), telling the caller to stop; a flush failure itself is reported to
/// each entry's callback but does not stop the writer.
fn flush_and_forward(journal: &mut Journal, commit_tx: &Sender<CommitBatch>, durable: &mut CommitBatch) -> bool {
    if durable.is_empty() {
        return true;
    }
    let batch = std::mem::take(durable);
    if let Err(e) = journal.flush() {
        let msg = e.to_string();
        error!("journal flush failed: {msg}");
        for entry in batch {
            (entry.callback)(-1, Err(Error::CorruptJournal(format!("flush failed: {msg}"))));
        }
        return true;
    }
    commit_tx.send(batch).is_ok()
}

fn rotate(journal: &mut Journal, manifest: &Manifest, wal_dir: &Path) -> crate::error::Result<()> {
    let meta = journal.get_meta();
    manifest.set_wal_header(WalHeader {
        filename: meta.filename,
        last_entry_id: meta.last_entry_id,
        old: true,
    })?;
    journal.mark_old();

    let new_name = manifest.get_next_wal()?;
    let new_journal = Journal::create(&wal_dir.join(&new_name))?;
    manifest.append_wal(new_name)?;
    *journal = new_journal;
    Ok(())
}
