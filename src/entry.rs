//! Length-framed binary record format used by the write-ahead journal.
//!
//! A record on disk is:
//!
//! ```text
//! u32 total_size   -- name_len + data_len + 16
//! u32 name_len
//! u32 data_len
//! i64 id
//! name_len bytes   -- big-endian i64 stream id, so name_len is always 8
//! data_len bytes   -- payload
//! u32 crc32c       -- over every byte above, not covered by total_size
//! ```
//!
//! `total_size` intentionally excludes the trailing checksum so that the
//! base framing matches the distilled wire format byte for byte; the
//! checksum is an addition this crate makes to catch corruption that the
//! base format alone would let slip through to a segment.

use std::io::{self, Read, Write};

use crc32c::Crc32cWriter;

use crate::error::{Error, Result};

/// Sentinel id used by [`crate::Store::close`] to signal shutdown through
/// the normal entry queue.
pub const CLOSE_SIGNAL: i64 = i64::MIN;

/// A one-shot completion callback. Invoked exactly once, with the new end
/// offset of the stream on success.
pub type Callback = Box<dyn FnOnce(i64, Result<()>) + Send>;

fn noop_callback() -> Callback {
    Box::new(|_, _| {})
}

/// One durable append, in flight between submission and commit.
///
/// `callback` is never persisted; it exists only to carry the completion
/// notification from the journal writer through the committer back to the
/// original caller.
pub struct Entry {
    pub id: i64,
    pub stream_id: i64,
    pub payload: Vec<u8>,
    pub callback: Callback,
}

impl Entry {
    pub fn new(id: i64, stream_id: i64, payload: Vec<u8>, callback: Callback) -> Self {
        Self {
            id,
            stream_id,
            payload,
            callback,
        }
    }

    pub fn close_signal() -> Self {
        Self {
            id: CLOSE_SIGNAL,
            stream_id: 0,
            payload: Vec::new(),
            callback: noop_callback(),
        }
    }

    pub fn is_close_signal(&self) -> bool {
        self.id == CLOSE_SIGNAL
    }

    /// Size of the base frame (excluding the `total_size` field itself and
    /// the trailing checksum), i.e. `name_len + data_len + 16`.
    fn body_size(&self) -> u32 {
        (NAME_LEN + self.payload.len() + 16) as u32
    }

    /// Encode this entry and append it to `out`.
    pub fn write<W: Write>(&self, out: W) -> io::Result<()> {
        let mut out = Crc32cWriter::new(out);

        out.write_all(&self.body_size().to_be_bytes())?;
        out.write_all(&(NAME_LEN as u32).to_be_bytes())?;
        out.write_all(&(self.payload.len() as u32).to_be_bytes())?;
        out.write_all(&self.id.to_be_bytes())?;
        out.write_all(&self.stream_id.to_be_bytes())?;
        out.write_all(&self.payload)?;

        let crc = out.crc32c();
        let mut out = out.into_inner();
        out.write_all(&crc.to_be_bytes())?;
        Ok(())
    }
}

const NAME_LEN: usize = 8;

/// A decoded entry, stripped of its (never-persisted) callback.
pub struct DecodedEntry {
    pub id: i64,
    pub stream_id: i64,
    pub payload: Vec<u8>,
}

/// Decode one entry from `reader`.
///
/// Returns `Ok(None)` if `reader` is already at EOF before any byte of a
/// new record has been read. Any other short read is a corrupt/truncated
/// journal.
pub fn decode<R: Read>(mut reader: R) -> Result<Option<DecodedEntry>> {
    let mut size_buf = [0u8; 4];
    if !read_exact_or_eof(&mut reader, &mut size_buf)? {
        return Ok(None);
    }
    let total_size = u32::from_be_bytes(size_buf);

    let mut frame = vec![0u8; total_size as usize];
    reader
        .read_exact(&mut frame)
        .map_err(|_| Error::CorruptJournal("unexpected end of input".into()))?;

    let mut crc_buf = [0u8; 4];
    reader
        .read_exact(&mut crc_buf)
        .map_err(|_| Error::CorruptJournal("unexpected end of input".into()))?;
    let stored_crc = u32::from_be_bytes(crc_buf);

    let computed = crc32c::crc32c_append(crc32c::crc32c(&size_buf), &frame);
    if computed != stored_crc {
        return Err(Error::CorruptJournal(format!(
            "checksum mismatch: computed={computed} stored={stored_crc}"
        )));
    }

    let mut cursor = frame.as_slice();
    let name_len = read_u32(&mut cursor)?;
    let data_len = read_u32(&mut cursor)?;
    let id = read_i64(&mut cursor)?;

    if total_size != name_len + data_len + 16 {
        return Err(Error::CorruptJournal("unexpected end of input".into()));
    }
    if name_len as usize != NAME_LEN {
        return Err(Error::CorruptJournal(format!(
            "unsupported name_len {name_len}, expected {NAME_LEN}"
        )));
    }
    if cursor.len() != NAME_LEN + data_len as usize {
        return Err(Error::CorruptJournal("unexpected end of input".into()));
    }

    let stream_id = read_i64(&mut cursor)?;
    let payload = cursor.to_vec();

    Ok(Some(DecodedEntry { id, stream_id, payload }))
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(Error::CorruptJournal("unexpected end of input".into()));
    }
    let (head, tail) = cursor.split_at(4);
    *cursor = tail;
    Ok(u32::from_be_bytes(head.try_into().unwrap()))
}

fn read_i64(cursor: &mut &[u8]) -> Result<i64> {
    if cursor.len() < 8 {
        return Err(Error::CorruptJournal("unexpected end of input".into()));
    }
    let (head, tail) = cursor.split_at(8);
    *cursor = tail;
    Ok(i64::from_be_bytes(head.try_into().unwrap()))
}

/// Like `read_exact`, but returns `Ok(false)` instead of an error if zero
/// bytes could be read (clean EOF), and still errors on a *partial* read.
fn read_exact_or_eof<R: Read>(mut reader: R, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => {
                if read == 0 {
                    return Ok(false);
                }
                return Err(Error::CorruptJournal("unexpected end of input".into()));
            }
            Ok(n) => read += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(id: i64, stream_id: i64, payload: &[u8]) -> DecodedEntry {
        let entry = Entry::new(id, stream_id, payload.to_vec(), noop_callback());
        let mut buf = Vec::new();
        entry.write(&mut buf).unwrap();
        decode(&mut buf.as_slice()).unwrap().unwrap()
    }

    #[test]
    fn entry_roundtrip() {
        let decoded = roundtrip(42, 7, b"hello world");
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(decoded.payload, b"hello world");
    }

    #[test]
    fn empty_payload_roundtrips() {
        let decoded = roundtrip(1, 1, b"");
        assert_eq!(decoded.payload, Vec::<u8>::new());
    }

    #[test]
    fn decode_of_empty_reader_is_none() {
        assert!(decode(&mut [].as_slice()).unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_corrupt() {
        let entry = Entry::new(1, 1, b"hello".to_vec(), noop_callback());
        let mut buf = Vec::new();
        entry.write(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(decode(&mut buf.as_slice()), Err(Error::CorruptJournal(_))));
    }

    #[test]
    fn bitflip_in_payload_is_detected() {
        let entry = Entry::new(1, 1, vec![1u8; 64], noop_callback());
        let mut buf = Vec::new();
        entry.write(&mut buf).unwrap();
        // flip a bit inside the payload region, well clear of the header.
        let payload_start = 4 + 4 + 4 + 8 + NAME_LEN;
        buf[payload_start] ^= 0xFF;
        assert!(matches!(decode(&mut buf.as_slice()), Err(Error::CorruptJournal(_))));
    }
}
