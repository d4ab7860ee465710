//! Append-only file of length-framed [`crate::entry::Entry`] records.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::entry::{self, DecodedEntry, Entry};
use crate::error::{Error, Result};

/// The header record a [`Journal`] reports about itself; the durable copy
/// of this lives in the manifest (see `manifest::WalHeader`), not in the
/// journal file itself.
#[derive(Clone, Debug)]
pub struct Meta {
    pub filename: String,
    pub last_entry_id: i64,
    pub old: bool,
}

/// A single journal file, open for appending.
pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
    meta: Meta,
}

impl Journal {
    /// Create a brand new, empty journal file. Fails if it already exists.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create_new(true).append(true).read(true).open(path)?;
        let filename = file_name(path);
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            bytes_written: 0,
            meta: Meta {
                filename,
                last_entry_id: -1,
                old: false,
            },
        })
    }

    /// Open an existing journal file for continued appending.
    pub fn open_for_write(path: &Path, last_entry_id: i64) -> Result<Self> {
        let file = OpenOptions::new().append(true).read(true).open(path)?;
        let bytes_written = file.metadata()?.len();
        let filename = file_name(path);
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            bytes_written,
            meta: Meta {
                filename,
                last_entry_id,
                old: false,
            },
        })
    }

    pub fn filename(&self) -> &str {
        &self.meta.filename
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_meta(&self) -> Meta {
        self.meta.clone()
    }

    pub fn mark_old(&mut self) {
        self.meta.old = true;
    }

    /// Current byte length of the journal.
    pub fn size(&self) -> u64 {
        self.bytes_written
    }

    /// Encode `entry` and append it. Does not flush.
    pub fn write(&mut self, entry: &Entry) -> Result<()> {
        let before = self.bytes_written;
        entry.write(CountingWriter {
            inner: &mut self.writer,
            written: &mut self.bytes_written,
        })?;
        debug_assert!(self.bytes_written > before);
        self.meta.last_entry_id = entry.id;
        Ok(())
    }

    /// Force buffered bytes to durable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Replay every entry from the beginning, invoking `visitor` for each.
    ///
    /// Halts on the first error `visitor` returns. Entry ids observed must
    /// be strictly monotonic (each exactly one greater than the last);
    /// otherwise the journal is considered corrupt.
    pub fn read<F>(path: &Path, mut visitor: F) -> Result<()>
    where
        F: FnMut(DecodedEntry) -> Result<()>,
    {
        let file = File::open(path)?;
        let mut reader = std::io::BufReader::new(file);
        let mut last_id: Option<i64> = None;
        loop {
            let Some(decoded) = entry::decode(&mut reader)? else {
                break;
            };
            if let Some(prev) = last_id {
                if decoded.id != prev + 1 {
                    return Err(Error::CorruptJournal(format!(
                        "non-monotonic entry id: prev={prev} next={}",
                        decoded.id
                    )));
                }
            }
            last_id = Some(decoded.id);
            visitor(decoded)?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Wraps a `Write` to track bytes written, since `BufWriter` does not
/// expose the underlying file's length cheaply.
struct CountingWriter<'a, W> {
    inner: &'a mut W,
    written: &'a mut u64,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        *self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_cb() -> crate::entry::Callback {
        Box::new(|_, _| {})
    }

    #[test]
    fn write_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.wal");

        let mut journal = Journal::create(&path).unwrap();
        for id in 0..5 {
            journal.write(&Entry::new(id, 1, format!("entry-{id}").into_bytes(), noop_cb())).unwrap();
        }
        journal.flush().unwrap();
        assert_eq!(journal.get_meta().last_entry_id, 4);

        let mut seen = Vec::new();
        Journal::read(&path, |e| {
            seen.push((e.id, e.payload));
            Ok(())
        })
        .unwrap();

        assert_eq!(seen.len(), 5);
        assert_eq!(seen[2].0, 2);
        assert_eq!(seen[2].1, b"entry-2");
    }

    #[test]
    fn reopen_for_write_continues_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.wal");

        let mut journal = Journal::create(&path).unwrap();
        journal.write(&Entry::new(0, 1, b"a".to_vec(), noop_cb())).unwrap();
        journal.flush().unwrap();
        drop(journal);

        let mut journal = Journal::open_for_write(&path, 0).unwrap();
        journal.write(&Entry::new(1, 1, b"b".to_vec(), noop_cb())).unwrap();
        journal.flush().unwrap();

        let mut ids = Vec::new();
        Journal::read(&path, |e| {
            ids.push(e.id);
            Ok(())
        })
        .unwrap();
        assert_eq!(ids, vec![0, 1]);
    }
}
