//! Per-stream ordered sequence of location handles, unifying in-memory and
//! on-disk lookup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::mstream::Memstream;
use crate::segment::Segment;

/// A tagged reference to where one contiguous `[begin, end)` range of a
/// stream's bytes lives: either a (possibly still mutable) memstream, or an
/// immutable on-disk segment.
#[derive(Clone)]
pub enum Handle {
    Memstream(Arc<Memstream>),
    Segment { segment: Arc<Segment>, begin: i64, end: i64 },
}

impl Handle {
    pub fn begin(&self) -> i64 {
        match self {
            Handle::Memstream(m) => m.begin(),
            Handle::Segment { begin, .. } => *begin,
        }
    }

    pub fn end(&self) -> i64 {
        match self {
            Handle::Memstream(m) => m.end(),
            Handle::Segment { end, .. } => *end,
        }
    }

    pub fn read_at(&self, stream_id: i64, buf: &mut [u8], offset: i64) -> Result<usize> {
        match self {
            Handle::Memstream(m) => m.read_at(buf, offset),
            Handle::Segment { segment, .. } => segment.read_at(stream_id, buf, offset),
        }
    }

    fn is_same_memstream(&self, other: &Arc<Memstream>) -> bool {
        matches!(self, Handle::Memstream(m) if Arc::ptr_eq(m, other))
    }
}

type StreamHandles = Arc<RwLock<Vec<Handle>>>;

/// The full index: one ordered handle list per stream.
#[derive(Default)]
pub struct IndexTable {
    streams: RwLock<HashMap<i64, StreamHandles>>,
}

impl IndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream_handles(&self, stream_id: i64) -> StreamHandles {
        if let Some(h) = self.streams.read().get(&stream_id) {
            return h.clone();
        }
        self.streams
            .write()
            .entry(stream_id)
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
            .clone()
    }

    pub fn has_stream(&self, stream_id: i64) -> bool {
        self.streams.read().contains_key(&stream_id)
    }

    /// Ensure the tail handle for `stream_id` references `mstream`.
    /// Idempotent: does nothing if it already does.
    pub fn ensure_memstream(&self, stream_id: i64, mstream: Arc<Memstream>) {
        let handles = self.stream_handles(stream_id);
        let mut handles = handles.write();
        if handles.last().is_some_and(|h| h.is_same_memstream(&mstream)) {
            return;
        }
        handles.push(Handle::Memstream(mstream));
    }

    /// Replace the handle(s) pointing at a frozen memstream with one
    /// pointing at the segment that now durably holds the same range, for
    /// every stream present in `segment`. Appends a fresh handle if the
    /// stream was not previously present in the index at all (recovery).
    pub fn install_segment(&self, segment: Arc<Segment>) {
        for stream_id in segment.streams().collect::<Vec<_>>() {
            let (begin, end) = segment.offset_range(stream_id).expect("stream listed by segment.streams()");
            let handles = self.stream_handles(stream_id);
            let mut handles = handles.write();
            if let Some(pos) = handles.iter().position(|h| h.begin() == begin && h.end() == end) {
                handles[pos] = Handle::Segment {
                    segment: segment.clone(),
                    begin,
                    end,
                };
            } else {
                handles.push(Handle::Segment {
                    segment: segment.clone(),
                    begin,
                    end,
                });
            }
        }
    }

    /// Locate the handle covering `offset` for `stream_id`.
    ///
    /// Returns `Ok(None)` if `offset` equals the current durable end
    /// (end-of-stream, not an error).
    pub fn find(&self, stream_id: i64, offset: i64) -> Result<Option<Handle>> {
        let handles = self
            .streams
            .read()
            .get(&stream_id)
            .cloned()
            .ok_or(Error::NoSuchStream(stream_id))?;
        let handles = handles.read();
        if handles.is_empty() {
            return Err(Error::NoSuchStream(stream_id));
        }
        if offset == handles.last().unwrap().end() {
            return Ok(None);
        }
        // Handles are contiguous and ordered by `begin`; binary search for
        // the one whose range contains `offset`.
        let idx = handles.partition_point(|h| h.begin() <= offset);
        if idx == 0 {
            return Err(Error::OffsetOutOfRange {
                offset,
                begin: handles[0].begin(),
                end: handles.last().unwrap().end(),
            });
        }
        let handle = &handles[idx - 1];
        if offset >= handle.end() {
            return Err(Error::OffsetOutOfRange {
                offset,
                begin: handle.begin(),
                end: handle.end(),
            });
        }
        Ok(Some(handle.clone()))
    }

    /// Remove every handle referencing `segment` from the index (invoked
    /// when a segment is GC'd). Safe to call even if some of its streams'
    /// handles have already moved on to a newer segment covering the same
    /// range (shouldn't happen, but is a no-op rather than a panic).
    pub fn remove_segment(&self, segment: &Arc<Segment>) {
        let stream_ids: Vec<i64> = self.streams.read().keys().copied().collect();
        for stream_id in stream_ids {
            let handles = self.stream_handles(stream_id);
            let mut handles = handles.write();
            handles.retain(|h| !matches!(h, Handle::Segment { segment: s, .. } if Arc::ptr_eq(s, segment)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_within_single_memstream() {
        let index = IndexTable::new();
        let m = Arc::new(Memstream::new(1, 0, 16));
        m.write(-1, b"hello world");
        index.ensure_memstream(1, m.clone());

        let handle = index.find(1, 3).unwrap().unwrap();
        assert_eq!(handle.begin(), 0);
        assert_eq!(handle.end(), 11);
    }

    #[test]
    fn find_at_end_is_none() {
        let index = IndexTable::new();
        let m = Arc::new(Memstream::new(1, 0, 16));
        m.write(-1, b"abc");
        index.ensure_memstream(1, m);
        assert!(index.find(1, 3).unwrap().is_none());
    }

    #[test]
    fn unknown_stream_errors() {
        let index = IndexTable::new();
        assert!(matches!(index.find(99, 0), Err(Error::NoSuchStream(99))));
    }
}
