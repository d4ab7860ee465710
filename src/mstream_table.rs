//! Mapping `stream_id -> Memstream` for the current flush generation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::mstream::Memstream;

/// All in-memory mutable data for one flush generation.
///
/// Created empty on startup and after each flush, written only by the
/// committer, frozen (no further writes) when handed to the flusher, and
/// dropped once its segment is installed and no reader still holds a
/// memstream handle into it.
pub struct MemstreamTable {
    ver: u64,
    streams: HashMap<i64, Arc<Memstream>>,
}

impl MemstreamTable {
    pub fn new(ver: u64) -> Self {
        Self {
            ver,
            streams: HashMap::new(),
        }
    }

    pub fn ver(&self) -> u64 {
        self.ver
    }

    pub fn get(&self, stream_id: i64) -> Option<Arc<Memstream>> {
        self.streams.get(&stream_id).cloned()
    }

    /// Returns the memstream for `stream_id`, creating it (beginning at
    /// `begin`) if this is the first write to the stream in this
    /// generation.
    pub fn get_or_create(&mut self, stream_id: i64, begin: i64, block_size: usize) -> Arc<Memstream> {
        self.streams
            .entry(stream_id)
            .or_insert_with(|| Arc::new(Memstream::new(stream_id, begin, block_size)))
            .clone()
    }

    pub fn streams(&self) -> impl Iterator<Item = (&i64, &Arc<Memstream>)> {
        self.streams.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Aggregate size in bytes across every stream in this generation.
    ///
    /// Recomputed on demand rather than tracked incrementally: memstreams
    /// are written directly through their own `Arc`, so the table cannot
    /// cheaply observe every write.
    pub fn aggregate_size(&self) -> usize {
        self.streams.values().map(|m| m.len()).sum()
    }
}
