//! Immutable, indexed on-disk serialization of one [`crate::mstream_table::MemstreamTable`].
//!
//! Layout: the concatenated byte ranges of every stream present in the
//! flushed table, in arbitrary order, followed by a footer recording where
//! each stream's range begins and ends (both in the stream's own absolute
//! offset space, and as a byte position within this file), the table's
//! `ver` and `last_entry_id`, and a trailing checksum over the footer.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use scopeguard::ScopeGuard;

use crate::error::{Error, Result};
use crate::mstream_table::MemstreamTable;

const MAGIC: &[u8; 8] = b"STRMSEG1";

#[derive(Clone, Copy, Debug)]
struct OffsetInfo {
    begin: i64,
    end: i64,
    file_pos: u64,
}

/// Create a new segment file at `path` from the (frozen) `table`, recording
/// `last_entry_id` and `ver` in its footer.
pub fn write_segment(path: &Path, table: &MemstreamTable, last_entry_id: i64, ver: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;

    // If any write below fails, the half-written file is removed rather
    // than left behind for recovery's orphan sweep to trip over.
    let guard = scopeguard::guard(path.to_path_buf(), |path| {
        let _ = std::fs::remove_file(path);
    });

    let mut pos: u64 = 0;
    let mut infos = Vec::new();
    for (&stream_id, mstream) in table.streams() {
        let file_pos = pos;
        let n = mstream.write_to(&mut file)?;
        pos += n as u64;
        infos.push((stream_id, OffsetInfo {
            begin: mstream.begin(),
            end: mstream.end(),
            file_pos,
        }));
    }

    let mut footer = Vec::new();
    footer.extend_from_slice(MAGIC);
    footer.extend_from_slice(&ver.to_be_bytes());
    footer.extend_from_slice(&last_entry_id.to_be_bytes());
    footer.extend_from_slice(&(infos.len() as u32).to_be_bytes());
    for (stream_id, info) in &infos {
        footer.extend_from_slice(&stream_id.to_be_bytes());
        footer.extend_from_slice(&info.begin.to_be_bytes());
        footer.extend_from_slice(&info.end.to_be_bytes());
        footer.extend_from_slice(&info.file_pos.to_be_bytes());
    }

    let crc = crc32c::crc32c(&footer);
    file.write_all(&footer)?;
    file.write_all(&(footer.len() as u32).to_be_bytes())?;
    file.write_all(&crc.to_be_bytes())?;
    file.sync_all()?;

    ScopeGuard::into_inner(guard);
    Ok(())
}

/// A segment opened for reading: its footer metadata, and a file handle
/// used for lock-free concurrent positional reads.
pub struct Segment {
    path: PathBuf,
    file: File,
    ver: u64,
    last_entry_id: i64,
    infos: HashMap<i64, (i64, i64, u64)>, // stream_id -> (begin, end, file_pos)
}

impl Segment {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < 8 {
            return Err(Error::CorruptSegment(format!("{}: too short", path.display())));
        }

        let mut trailer = [0u8; 8];
        file.read_exact_at(&mut trailer, len - 8)
            .map_err(|e| Error::CorruptSegment(format!("{}: reading trailer: {e}", path.display())))?;
        let footer_len = u32::from_be_bytes(trailer[0..4].try_into().unwrap()) as u64;
        let stored_crc = u32::from_be_bytes(trailer[4..8].try_into().unwrap());

        if len < 8 + footer_len {
            return Err(Error::CorruptSegment(format!("{}: footer longer than file", path.display())));
        }
        let footer_start = len - 8 - footer_len;
        let mut footer = vec![0u8; footer_len as usize];
        file.read_exact_at(&mut footer, footer_start)
            .map_err(|e| Error::CorruptSegment(format!("{}: reading footer: {e}", path.display())))?;

        if crc32c::crc32c(&footer) != stored_crc {
            return Err(Error::CorruptSegment(format!("{}: footer checksum mismatch", path.display())));
        }

        let mut cursor = footer.as_slice();
        if cursor.len() < MAGIC.len() || &cursor[..MAGIC.len()] != MAGIC {
            return Err(Error::CorruptSegment(format!("{}: bad magic", path.display())));
        }
        cursor = &cursor[MAGIC.len()..];

        let ver = take_u64(&mut cursor)?;
        let last_entry_id = take_i64(&mut cursor)?;
        let count = take_u32(&mut cursor)?;

        let mut infos = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let stream_id = take_i64(&mut cursor)?;
            let begin = take_i64(&mut cursor)?;
            let end = take_i64(&mut cursor)?;
            let file_pos = take_u64(&mut cursor)?;
            infos.insert(stream_id, (begin, end, file_pos));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            ver,
            last_entry_id,
            infos,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ver(&self) -> u64 {
        self.ver
    }

    pub fn last_entry_id(&self) -> i64 {
        self.last_entry_id
    }

    /// The `[begin, end)` range this segment stores for `stream_id`, if any.
    pub fn offset_range(&self, stream_id: i64) -> Option<(i64, i64)> {
        self.infos.get(&stream_id).map(|&(begin, end, _)| (begin, end))
    }

    pub fn streams(&self) -> impl Iterator<Item = i64> + '_ {
        self.infos.keys().copied()
    }

    /// Read up to `buf.len()` bytes of `stream_id`'s data starting at
    /// `offset` (in the stream's own absolute offset space).
    pub fn read_at(&self, stream_id: i64, buf: &mut [u8], offset: i64) -> Result<usize> {
        let &(begin, end, file_pos) = self
            .infos
            .get(&stream_id)
            .ok_or(Error::NoSuchStream(stream_id))?;
        if offset < begin || offset > end {
            return Err(Error::OffsetOutOfRange { offset, begin, end });
        }
        if offset == end {
            return Ok(0);
        }
        let want = buf.len().min((end - offset) as usize);
        let at = file_pos + (offset - begin) as u64;
        self.file.read_at(&mut buf[..want], at)?;
        Ok(want)
    }
}

fn take_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(Error::CorruptSegment("truncated footer".into()));
    }
    let (head, tail) = cursor.split_at(4);
    *cursor = tail;
    Ok(u32::from_be_bytes(head.try_into().unwrap()))
}

fn take_u64(cursor: &mut &[u8]) -> Result<u64> {
    if cursor.len() < 8 {
        return Err(Error::CorruptSegment("truncated footer".into()));
    }
    let (head, tail) = cursor.split_at(8);
    *cursor = tail;
    Ok(u64::from_be_bytes(head.try_into().unwrap()))
}

fn take_i64(cursor: &mut &[u8]) -> Result<i64> {
    take_u64(cursor).map(|v| v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mstream::Memstream;
    use std::sync::Arc;

    #[test]
    fn roundtrip_single_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.seg");

        let mut table = MemstreamTable::new(1);
        let m = table.get_or_create(7, 0, 16);
        m.write(-1, b"hello world");

        write_segment(&path, &table, 42, 1).unwrap();
        let segment = Segment::open(&path).unwrap();

        assert_eq!(segment.last_entry_id(), 42);
        assert_eq!(segment.ver(), 1);
        assert_eq!(segment.offset_range(7), Some((0, 11)));

        let mut buf = [0u8; 11];
        let n = segment.read_at(7, &mut buf, 0).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
        assert_eq!(segment.read_at(7, &mut buf, 11).unwrap(), 0);
    }

    #[test]
    fn roundtrip_multiple_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.seg");

        let mut table = MemstreamTable::new(1);
        for i in 0..10 {
            let m: Arc<Memstream> = table.get_or_create(i, 0, 32);
            m.write(-1, format!("stream-{i}").as_bytes());
        }
        write_segment(&path, &table, 100, 3).unwrap();
        let segment = Segment::open(&path).unwrap();

        for i in 0..10 {
            let (begin, end) = segment.offset_range(i).unwrap();
            let mut buf = vec![0u8; (end - begin) as usize];
            segment.read_at(i, &mut buf, begin).unwrap();
            assert_eq!(buf, format!("stream-{i}").into_bytes());
        }
    }

    #[test]
    fn corrupt_footer_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.seg");
        let mut table = MemstreamTable::new(1);
        table.get_or_create(1, 0, 16).write(-1, b"x");
        write_segment(&path, &table, 1, 1).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(Segment::open(&path), Err(Error::CorruptSegment(_))));
    }
}
