//! Stitches together index handles to satisfy sequential reads across the
//! memtable/segment boundary.

use std::io;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::index::{Handle, IndexTable};

/// A sequential, stateful byte reader over one stream, starting at
/// offset 0 (or wherever [`Reader::seek_to`] last left it).
///
/// Holds a cloned handle reference rather than re-resolving the index on
/// every call, so a concurrent index mutation (e.g. a flush) cannot
/// invalidate an in-flight read; the reader only re-resolves once it has
/// exhausted the handle it is currently holding.
pub struct Reader {
    index: Arc<IndexTable>,
    stream_id: i64,
    offset: i64,
    current: Option<Handle>,
}

impl Reader {
    pub(crate) fn new(index: Arc<IndexTable>, stream_id: i64) -> Result<Self> {
        if !index.has_stream(stream_id) {
            return Err(Error::NoSuchStream(stream_id));
        }
        Ok(Self {
            index,
            stream_id,
            offset: 0,
            current: None,
        })
    }

    pub fn stream_id(&self) -> i64 {
        self.stream_id
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn seek_to(&mut self, offset: i64) {
        self.offset = offset;
        self.current = None;
    }

    /// Read up to `buf.len()` bytes. Returns `0` at true end-of-stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.current.is_none() || self.offset >= self.current.as_ref().unwrap().end() {
                self.current = self.index.find(self.stream_id, self.offset)?;
            }
            let Some(handle) = &self.current else {
                return Ok(0);
            };
            let n = handle.read_at(self.stream_id, buf, self.offset)?;
            if n == 0 {
                // Handle reports EOF for this offset (can happen right at
                // the boundary between two handles); force a re-resolve.
                self.current = None;
                if self.index.find(self.stream_id, self.offset)?.is_none() {
                    return Ok(0);
                }
                continue;
            }
            self.offset += n as i64;
            return Ok(n);
        }
    }

    /// Read until end-of-stream, returning every byte.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }
}

impl io::Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Reader::read(self, buf).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}
