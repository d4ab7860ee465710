//! Per-stream in-memory, page-chunked mutable byte buffer.

use std::io::{self, Write};

use parking_lot::RwLock;

use crate::error::{Error, Result};

struct Page {
    begin: i64,
    limit: usize,
    buf: Vec<u8>,
}

impl Page {
    fn new(begin: i64, block_size: usize) -> Self {
        Self {
            begin,
            limit: 0,
            buf: vec![0u8; block_size],
        }
    }

    fn write_to<W: Write>(&self, out: &mut W) -> io::Result<usize> {
        out.write_all(&self.buf[..self.limit])?;
        Ok(self.limit)
    }
}

struct Inner {
    begin: i64,
    end: i64,
    pages: Vec<Page>,
    block_size: usize,
}

/// A contiguous, mutable `[begin, end)` byte range of one stream, held
/// entirely in memory as a sequence of fixed-size pages.
///
/// Many concurrent readers may call [`Memstream::read_at`]; writes are
/// serialized against both reads and other writes by an internal
/// `parking_lot::RwLock`.
pub struct Memstream {
    stream_id: i64,
    inner: RwLock<Inner>,
}

impl Memstream {
    pub fn new(stream_id: i64, begin: i64, block_size: usize) -> Self {
        Self {
            stream_id,
            inner: RwLock::new(Inner {
                begin,
                end: begin,
                pages: vec![Page::new(begin, block_size)],
                block_size,
            }),
        }
    }

    pub fn stream_id(&self) -> i64 {
        self.stream_id
    }

    pub fn begin(&self) -> i64 {
        self.inner.read().begin
    }

    pub fn end(&self) -> i64 {
        self.inner.read().end
    }

    /// Total bytes currently buffered (`end - begin`).
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        (inner.end - inner.begin) as usize
    }

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns `Ok(0)` (end-of-stream) if `offset == end`. The returned
    /// count may be short of `buf.len()`; callers retry.
    pub fn read_at(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let inner = self.inner.read();
        if offset < inner.begin || offset > inner.end {
            return Err(Error::OffsetOutOfRange {
                offset,
                begin: inner.begin,
                end: inner.end,
            });
        }
        if offset == inner.end {
            return Ok(0);
        }

        let rel = (offset - inner.begin) as usize;
        let mut page_idx = rel / inner.block_size;
        let mut page_off = rel % inner.block_size;

        let mut written = 0;
        while written < buf.len() {
            let Some(page) = inner.pages.get(page_idx) else {
                break;
            };
            if page_off >= page.limit {
                break;
            }
            let avail = &page.buf[page_off..page.limit];
            let n = avail.len().min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&avail[..n]);
            written += n;
            page_off = 0;
            page_idx += 1;
        }
        Ok(written)
    }

    /// Append `payload` at `offset`.
    ///
    /// `offset == -1` means "append at the current end". Any other value
    /// must equal the current end, or the write is rejected with `-1`
    /// (offset contention) and the stream is left unchanged.
    pub fn write(&self, offset: i64, payload: &[u8]) -> i64 {
        let mut inner = self.inner.write();
        if offset != -1 && offset != inner.end {
            return -1;
        }

        let block_size = inner.block_size;
        let mut remaining = payload;
        while !remaining.is_empty() {
            if inner.pages.last().unwrap().limit == block_size {
                let next_begin = inner.end;
                inner.pages.push(Page::new(next_begin, block_size));
            }
            let page = inner.pages.last_mut().unwrap();
            let space = block_size - page.limit;
            let n = space.min(remaining.len());
            page.buf[page.limit..page.limit + n].copy_from_slice(&remaining[..n]);
            page.limit += n;
            inner.end += n as i64;
            remaining = &remaining[n..];
        }
        inner.end
    }

    /// Write every buffered byte, in order, to `writer`. Used only by the
    /// flusher on a frozen memstream.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<usize> {
        let inner = self.inner.read();
        let mut n = 0;
        for page in &inner.pages {
            n += page.write_to(writer)?;
        }
        Ok(n)
    }
}
