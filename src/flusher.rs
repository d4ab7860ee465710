//! Serializes a frozen [`crate::mstream_table::MemstreamTable`] to a new
//! segment file, off the committer's thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use log::info;

use crate::error::Result;
use crate::manifest::Manifest;
use crate::mstream_table::MemstreamTable;
use crate::segment;

type Job = Box<dyn FnOnce() + Send>;

/// Result of a successful flush: the segment's filename and the `ver` it
/// was written with.
pub type FlushResult = Result<(String, u64)>;

/// Single worker, queue depth 1: at most one flush may be in flight, which
/// keeps the committer's freeze-and-handoff naturally backpressured.
pub struct Flusher {
    tx: Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<Job>(1);
        let handle = std::thread::Builder::new()
            .name("streamlog-flusher".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("failed to spawn flusher thread");
        Self { tx, handle: Some(handle) }
    }

    /// Enqueue `table` to be flushed; `cb` is invoked with the result once
    /// the segment has been written, registered with the manifest, and
    /// closed.
    pub fn append<F>(&self, manifest: Arc<Manifest>, segment_dir: PathBuf, table: Arc<MemstreamTable>, last_entry_id: i64, cb: F)
    where
        F: FnOnce(FlushResult) + Send + 'static,
    {
        let job: Job = Box::new(move || {
            let result = flush_one(&manifest, &segment_dir, &table, last_entry_id);
            cb(result);
        });
        self.tx.send(job).expect("flusher thread is gone");
    }

    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Replacing `tx` drops the original sender, which closes the
            // channel and lets the worker's `for job in rx` loop end.
            let (tx, _rx) = crossbeam_channel::bounded(1);
            self.tx = tx;
            let _ = handle.join();
        }
    }
}

impl Default for Flusher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.close();
    }
}

fn flush_one(manifest: &Manifest, segment_dir: &std::path::Path, table: &MemstreamTable, last_entry_id: i64) -> FlushResult {
    let filename = manifest.get_next_segment()?;
    let path = segment_dir.join(&filename);
    let ver = table.ver();
    info!("flushing memstream table ver={ver} to segment {filename}");
    segment::write_segment(&path, table, last_entry_id, ver)?;
    manifest.append_segment(filename.clone())?;
    Ok((filename, ver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;

    #[test]
    fn flushed_table_is_readable_back() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Arc::new(Manifest::open(&dir.path().join("manifest")).unwrap());
        let segment_dir = dir.path().join("segments");
        std::fs::create_dir_all(&segment_dir).unwrap();

        let mut table = MemstreamTable::new(1);
        table.get_or_create(7, 0, 16).write(-1, b"hello world");

        let flusher = Flusher::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        flusher.append(manifest.clone(), segment_dir.clone(), Arc::new(table), 9, move |result| {
            let _ = tx.send(result);
        });

        let (filename, ver) = rx.recv().unwrap().unwrap();
        assert_eq!(ver, 1);
        assert_eq!(manifest.get_segment_files(), vec![filename.clone()]);

        let segment = Segment::open(&segment_dir.join(&filename)).unwrap();
        assert_eq!(segment.last_entry_id(), 9);
        let mut buf = [0u8; 11];
        segment.read_at(7, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello world");
    }
}
