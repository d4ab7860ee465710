//! Committer thread: the only thing that ever mutates the active
//! [`MemstreamTable`]. Applies durable batches from the journal writer,
//! then asks the flusher to serialize a generation once it grows past
//! `max_mstream_table_size`.

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use log::{error, info};

use crate::end_map::EndMap;
use crate::entry::Entry;
use crate::flusher::Flusher;
use crate::index::IndexTable;
use crate::manifest::Manifest;
use crate::mstream_table::MemstreamTable;
use crate::segment::Segment;
use crate::segments::SegmentRegistry;
use crate::watcher::Notifier;
use crate::wwriter::CommitBatch;

pub struct CommitterConfig {
    pub index: Arc<IndexTable>,
    pub end_map: Arc<EndMap>,
    pub notifier: Arc<Notifier>,
    pub manifest: Arc<Manifest>,
    pub flusher: Arc<Flusher>,
    pub segments: Arc<SegmentRegistry>,
    pub segment_dir: PathBuf,
    pub block_size: usize,
    pub max_mstream_table_size: usize,
}

/// Runs until `commit_rx` disconnects or a close signal is observed,
/// flushing whatever is left in the current generation before returning.
pub fn run(cfg: CommitterConfig, commit_rx: Receiver<CommitBatch>, mut table: Arc<MemstreamTable>, mut last_entry_id: i64) {
    loop {
        let batch = match commit_rx.recv() {
            Ok(b) => b,
            Err(_) => break,
        };

        let mut closing = false;
        for entry in batch {
            if entry.is_close_signal() {
                closing = true;
                continue;
            }
            last_entry_id = apply(&cfg, &mut table, entry);
        }

        if table.aggregate_size() >= cfg.max_mstream_table_size {
            table = freeze_and_flush(&cfg, table, last_entry_id, false);
        }

        if closing {
            if !table.is_empty() {
                freeze_and_flush(&cfg, table, last_entry_id, true);
            }
            break;
        }
    }
}

/// Apply one durable entry to the active generation, returning its id.
///
/// Also used directly (not via `run`'s channel loop) by recovery, which
/// replays journal entries on the opening thread before the committer
/// thread is spawned for live traffic.
pub(crate) fn apply(cfg: &CommitterConfig, table: &mut Arc<MemstreamTable>, entry: Entry) -> i64 {
    let begin = cfg.end_map.get(entry.stream_id).map(|(end, _)| end).unwrap_or(0);
    let mstream = Arc::get_mut(table)
        .expect("memstream table is only ever shared once frozen and handed to the flusher")
        .get_or_create(entry.stream_id, begin, cfg.block_size);
    let new_end = mstream.write(-1, &entry.payload);
    cfg.index.ensure_memstream(entry.stream_id, mstream);
    cfg.end_map.set(entry.stream_id, new_end, table.ver());
    cfg.notifier.notify(entry.stream_id, new_end);

    let id = entry.id;
    (entry.callback)(new_end, Ok(()));
    id
}

/// Swap in a fresh, empty generation and hand the frozen one to the
/// flusher. When `wait` is set (shutdown path), blocks until the flush has
/// completed and been installed into the index, so the caller can safely
/// tear down the manifest and flusher threads afterwards.
pub(crate) fn freeze_and_flush(cfg: &CommitterConfig, table: Arc<MemstreamTable>, last_entry_id: i64, wait: bool) -> Arc<MemstreamTable> {
    let next_ver = table.ver() + 1;
    let index = cfg.index.clone();
    let segments = cfg.segments.clone();
    let segment_dir = cfg.segment_dir.clone();

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    info!("freezing memstream table ver={} ({} bytes)", table.ver(), table.aggregate_size());
    cfg.flusher.append(cfg.manifest.clone(), segment_dir.clone(), table, last_entry_id, move |result| {
        match result {
            Ok((filename, _ver)) => match Segment::open(&segment_dir.join(&filename)) {
                Ok(segment) => {
                    let segment = Arc::new(segment);
                    index.install_segment(segment.clone());
                    segments.insert(segment);
                }
                Err(e) => error!("failed to reopen freshly written segment {filename}: {e}"),
            },
            Err(e) => error!("flush failed: {e}"),
        }
        let _ = done_tx.send(());
    });

    if wait {
        let _ = done_rx.recv();
    }

    Arc::new(MemstreamTable::new(next_ver))
}
