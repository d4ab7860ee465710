//! The public entry point: configuration, recovery, and the seven external
//! operations (`async_append`, `append`, `reader`, `end`, `watcher`, `gc`,
//! `close`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{info, warn};
use parking_lot::Mutex;

use crate::committer::{self, CommitterConfig};
use crate::end_map::EndMap;
use crate::entry::{Callback, Entry};
use crate::error::{Error, Result};
use crate::flusher::Flusher;
use crate::index::IndexTable;
use crate::journal::Journal;
use crate::manifest::Manifest;
use crate::mstream_table::MemstreamTable;
use crate::queue::EntryQueue;
use crate::reader::Reader;
use crate::segment::Segment;
use crate::segments::SegmentRegistry;
use crate::watcher::{EndWatchers, Notifier, Watcher};
use crate::wwriter;

/// Configuration for [`Store::open`].
///
/// `wal_dir`, `segment_dir`, and `manifest_dir` are created if missing.
#[derive(Clone, Debug)]
pub struct Options {
    pub wal_dir: PathBuf,
    pub segment_dir: PathBuf,
    pub manifest_dir: PathBuf,
    /// Memstream page size in bytes.
    pub block_size: usize,
    /// Aggregate memstream bytes that triggers a flush.
    pub max_mstream_table_size: usize,
    /// Journal rotation threshold.
    pub max_wal_size: u64,
    /// Retention bound enforced by `gc()`.
    pub max_segment_count: usize,
    /// Bound on the caller-facing entry queue.
    pub entry_queue_cap: usize,
}

impl Options {
    /// Defaults rooted at `dir`, i.e. `dir/wal`, `dir/segments`, `dir/manifest`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            wal_dir: dir.join("wal"),
            segment_dir: dir.join("segments"),
            manifest_dir: dir.join("manifest"),
            ..Self::default()
        }
    }

    pub fn with_block_size(mut self, v: usize) -> Self {
        self.block_size = v;
        self
    }

    pub fn with_max_mstream_table_size(mut self, v: usize) -> Self {
        self.max_mstream_table_size = v;
        self
    }

    pub fn with_max_wal_size(mut self, v: u64) -> Self {
        self.max_wal_size = v;
        self
    }

    pub fn with_max_segment_count(mut self, v: usize) -> Self {
        self.max_segment_count = v;
        self
    }

    pub fn with_entry_queue_cap(mut self, v: usize) -> Self {
        self.entry_queue_cap = v;
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("wal"),
            segment_dir: PathBuf::from("segments"),
            manifest_dir: PathBuf::from("manifest"),
            block_size: 4096,
            max_mstream_table_size: 64 * 1024 * 1024,
            max_wal_size: 128 * 1024 * 1024,
            max_segment_count: 64,
            entry_queue_cap: 4096,
        }
    }
}

/// An open, recovered log store. Cloneable cheaply via `Arc<Store>`; every
/// method takes `&self` and is safe to call from any thread.
pub struct Store {
    options: Options,
    entry_queue: Arc<EntryQueue>,
    next_entry_id: AtomicI64,
    index: Arc<IndexTable>,
    end_map: Arc<EndMap>,
    watchers: Arc<EndWatchers>,
    manifest: Arc<Manifest>,
    flusher: Arc<Flusher>,
    notifier: Arc<Notifier>,
    segments: Arc<SegmentRegistry>,
    wwriter_handle: Mutex<Option<JoinHandle<()>>>,
    committer_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Store {
    /// Recover (or create) a store at `options`'s directories, then start
    /// its five worker threads.
    pub fn open(options: Options) -> Result<Self> {
        std::fs::create_dir_all(&options.wal_dir)?;
        std::fs::create_dir_all(&options.segment_dir)?;
        std::fs::create_dir_all(&options.manifest_dir)?;

        let manifest = Arc::new(Manifest::open(&options.manifest_dir)?);
        let index = Arc::new(IndexTable::new());
        let end_map = Arc::new(EndMap::new());
        let watchers = EndWatchers::new();
        let notifier = Arc::new(Notifier::spawn(watchers.clone()));
        let segments = Arc::new(SegmentRegistry::new());
        let flusher = Arc::new(Flusher::new());

        let mut entry_id: i64 = -1;

        // §4.11 step 4: replay segments in manifest order.
        for filename in manifest.get_segment_files() {
            let segment = Segment::open(&options.segment_dir.join(&filename))?;
            if segment.last_entry_id() <= entry_id {
                return Err(Error::ManifestInconsistent(format!(
                    "segment {filename} last_entry_id {} does not exceed running entry id {entry_id}",
                    segment.last_entry_id()
                )));
            }
            entry_id = segment.last_entry_id();
            for stream_id in segment.streams().collect::<Vec<_>>() {
                let (_, end) = segment.offset_range(stream_id).expect("stream listed by segment.streams()");
                end_map.set(stream_id, end, segment.ver());
            }
            let segment = Arc::new(segment);
            index.install_segment(segment.clone());
            segments.insert(segment);
        }

        let cfg = CommitterConfig {
            index: index.clone(),
            end_map: end_map.clone(),
            notifier: notifier.clone(),
            manifest: manifest.clone(),
            flusher: flusher.clone(),
            segments: segments.clone(),
            segment_dir: options.segment_dir.clone(),
            block_size: options.block_size,
            max_mstream_table_size: options.max_mstream_table_size,
        };
        let mut table = Arc::new(MemstreamTable::new(segments.max_ver().map(|v| v + 1).unwrap_or(0)));

        // §4.11 step 5: replay journals in manifest order, applying each
        // recovered entry directly through the committer's own apply logic
        // (no committer thread is running yet, so this is synchronous and
        // its errors propagate straight out of `open`).
        let wal_files = manifest.get_wal_files();
        for filename in &wal_files {
            let header = manifest.get_wal_header(filename);
            if let Some(h) = &header {
                if h.old && h.last_entry_id <= entry_id {
                    info!("journal {filename} fully covered by an installed segment, skipping replay");
                    continue;
                }
            }
            let path = options.wal_dir.join(filename);
            Journal::read(&path, |decoded| {
                if decoded.id <= entry_id {
                    return Ok(());
                }
                if decoded.id != entry_id + 1 {
                    return Err(Error::ManifestInconsistent(format!(
                        "journal {filename} entry id {} is not the successor of {entry_id}",
                        decoded.id
                    )));
                }
                let entry = Entry::new(decoded.id, decoded.stream_id, decoded.payload, Box::new(|_, _| {}));
                entry_id = committer::apply(&cfg, &mut table, entry);
                if table.aggregate_size() >= options.max_mstream_table_size {
                    let frozen = std::mem::replace(&mut table, Arc::new(MemstreamTable::new(0)));
                    table = committer::freeze_and_flush(&cfg, frozen, entry_id, true);
                }
                Ok(())
            })?;
        }

        // §4.11 step 6: open (or create) the active journal.
        let active_name = wal_files.iter().find(|f| {
            manifest
                .get_wal_header(f)
                .map(|h| !h.old)
                .unwrap_or(true)
        });
        let active_journal = match active_name {
            Some(name) => Journal::open_for_write(&options.wal_dir.join(name), entry_id)?,
            None => {
                let name = manifest.get_next_wal()?;
                let journal = Journal::create(&options.wal_dir.join(&name))?;
                manifest.append_wal(name)?;
                journal
            }
        };

        // §4.11 step 7: delete orphan files absent from the manifest.
        let known_wals: HashSet<String> = manifest.get_wal_files().into_iter().collect();
        remove_orphans(&options.wal_dir, &known_wals)?;
        let known_segments: HashSet<String> = manifest.get_segment_files().into_iter().collect();
        remove_orphans(&options.segment_dir, &known_segments)?;

        let entry_queue = Arc::new(EntryQueue::bounded(options.entry_queue_cap));
        let (commit_tx, commit_rx) = crossbeam_channel::unbounded();

        let wwriter_handle = {
            let manifest = manifest.clone();
            let wal_dir = options.wal_dir.clone();
            let max_wal_size = options.max_wal_size;
            let entry_queue = entry_queue.clone();
            std::thread::Builder::new()
                .name("streamlog-wwriter".into())
                .spawn(move || wwriter::run(active_journal, manifest, wal_dir, max_wal_size, entry_queue, commit_tx))
                .expect("failed to spawn journal writer thread")
        };

        let committer_handle = std::thread::Builder::new()
            .name("streamlog-committer".into())
            .spawn(move || committer::run(cfg, commit_rx, table, entry_id))
            .expect("failed to spawn committer thread");

        Ok(Self {
            options,
            entry_queue,
            next_entry_id: AtomicI64::new(entry_id + 1),
            index,
            end_map,
            watchers,
            manifest,
            flusher,
            notifier,
            segments,
            wwriter_handle: Mutex::new(Some(wwriter_handle)),
            committer_handle: Mutex::new(Some(committer_handle)),
            closed: AtomicBool::new(false),
        })
    }

    /// Submit an append without blocking; `cb` fires once the entry is
    /// durable and has been applied.
    ///
    /// `expected_offset == -1` means "append at the current end". Any other
    /// value is checked against the stream's current durable end *before*
    /// the entry is assigned an id, so a conflicting append never reaches
    /// the journal at all.
    pub fn async_append(&self, stream_id: i64, payload: Vec<u8>, expected_offset: i64, cb: Callback) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if expected_offset != -1 {
            let current = self.end_map.get(stream_id).map(|(end, _)| end).unwrap_or(0);
            if expected_offset != current {
                return Err(Error::OffsetConflict {
                    expected: expected_offset,
                    actual: current,
                });
            }
        }
        let id = self.next_entry_id.fetch_add(1, Ordering::SeqCst);
        self.entry_queue.put(Entry::new(id, stream_id, payload, cb));
        Ok(())
    }

    /// Blocking wrapper over [`Store::async_append`]: posts the entry and
    /// waits for its callback, returning the new end offset.
    pub fn append(&self, stream_id: i64, payload: Vec<u8>, expected_offset: i64) -> Result<i64> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.async_append(
            stream_id,
            payload,
            expected_offset,
            Box::new(move |new_end, result| {
                let _ = tx.send(result.map(|()| new_end));
            }),
        )?;
        rx.recv().map_err(|_| Error::Closed)?
    }

    /// A sequential reader over `stream_id`, starting at offset 0.
    pub fn reader(&self, stream_id: i64) -> Result<Reader> {
        Reader::new(self.index.clone(), stream_id)
    }

    /// The current durable end offset for `stream_id`, or `None` if the
    /// stream has never been appended to.
    pub fn end(&self, stream_id: i64) -> Option<i64> {
        self.end_map.get(stream_id).map(|(end, _)| end)
    }

    /// Subscribe to end-offset changes for `stream_id`.
    pub fn watcher(&self, stream_id: i64) -> Watcher {
        self.watchers.subscribe(stream_id)
    }

    /// Enforce `max_segment_count` by deleting the oldest surplus segments,
    /// then delete any `old` journal fully covered by a live segment.
    ///
    /// A segment still referenced by an in-flight reader (`Arc` strong
    /// count above what the registry and index alone account for) is left
    /// in place for a future call rather than waited on.
    pub fn gc(&self) -> Result<()> {
        loop {
            let live = self.segments.len();
            if live <= self.options.max_segment_count {
                break;
            }
            let victims = self.segments.oldest(live - self.options.max_segment_count);
            let mut progressed = false;
            for segment in victims {
                // Expected owners at this point: the registry's own copy
                // (dropped by the `remove` call below) and one
                // `Handle::Segment` per stream this segment covers, still
                // installed in the index. Any count above that baseline is
                // a reader holding a cloned handle, so the strong-count
                // check must run, and must pass, *before* the index
                // handles are torn out (§4.12: only remove index handles
                // after confirming no reader holds them).
                let stream_count = segment.streams().count();
                self.segments.remove(&segment);
                if Arc::strong_count(&segment) > stream_count + 1 {
                    warn!("segment {} still referenced by a reader, deferring deletion", segment.path().display());
                    self.segments.insert(segment);
                    continue;
                }
                self.index.remove_segment(&segment);
                let path = segment.path().to_path_buf();
                drop(segment);
                let filename = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                self.manifest.delete_segment(filename)?;
                std::fs::remove_file(&path)?;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        let covered_up_to = self.segments.max_last_entry_id().unwrap_or(-1);
        for filename in self.manifest.get_wal_files() {
            let Some(header) = self.manifest.get_wal_header(&filename) else {
                continue;
            };
            if header.old && header.last_entry_id <= covered_up_to {
                self.manifest.delete_wal(filename.clone())?;
                let _ = std::fs::remove_file(self.options.wal_dir.join(&filename));
            }
        }
        Ok(())
    }

    /// Post the shutdown sentinel, wait for the writer and committer to
    /// drain and flush, then stop accepting new work.
    ///
    /// The flusher, manifest, and watcher-notifier threads are not joined
    /// here directly: once the writer and committer threads above have
    /// exited, this `Store` holds the only remaining `Arc` to each, so they
    /// stop (and join their own threads, via `Drop`) when this `Store` value
    /// is itself dropped.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.entry_queue.put(Entry::close_signal());
        if let Some(handle) = self.wwriter_handle.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.committer_handle.lock().take() {
            let _ = handle.join();
        }
        info!("store closed");
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn remove_orphans(dir: &Path, known: &HashSet<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if known.contains(&name) {
            continue;
        }
        warn!("removing orphan file {} not present in the manifest", entry.path().display());
        std::fs::remove_file(entry.path())?;
    }
    Ok(())
}
