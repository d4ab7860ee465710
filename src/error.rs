use std::io;

use thiserror::Error;

/// Errors returned by the public operations of a [`crate::Store`].
#[derive(Debug, Error)]
pub enum Error {
    /// A read was attempted at an offset outside the range ever written for
    /// that stream.
    #[error("offset {offset} out of range [{begin}, {end})")]
    OffsetOutOfRange { offset: i64, begin: i64, end: i64 },

    /// A write specified an `expected_offset` that did not match the
    /// stream's current durable end.
    #[error("write at offset {expected} conflicts with current end {actual}")]
    OffsetConflict { expected: i64, actual: i64 },

    /// A read or watch was requested for a stream that has never been
    /// appended to.
    #[error("no such stream: {0}")]
    NoSuchStream(i64),

    /// The write-ahead journal contains a record that fails its length
    /// check, checksum, or is out of the expected monotonic order.
    #[error("corrupt journal: {0}")]
    CorruptJournal(String),

    /// A segment file's footer could not be parsed or its checksum did not
    /// match.
    #[error("corrupt segment: {0}")]
    CorruptSegment(String),

    /// The manifest observed an entry-id or version regression across
    /// components during recovery.
    #[error("manifest inconsistent: {0}")]
    ManifestInconsistent(String),

    /// The store has been closed, or a prior fatal error (e.g. a failed
    /// flush) has put it into a closed state.
    #[error("store is closed")]
    Closed,

    /// Wraps an underlying OS-level I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
