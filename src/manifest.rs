//! Authoritative, durably-journaled record of the live set of journals and
//! segments.
//!
//! Every mutation is itself appended to a length-framed operation log under
//! `ManifestDir` and `fsync`ed before the call returns; on restart the log
//! is replayed to reconstruct state. All mutations are serialized onto one
//! dedicated thread (see §5 of the spec), so callers see ordinary blocking
//! calls while the crate still has exactly one manifest writer.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use log::debug;

use crate::error::{Error, Result};

const LOG_FILE_NAME: &str = "manifest.log";

#[derive(Clone, Debug, PartialEq)]
pub struct WalHeader {
    pub filename: String,
    pub last_entry_id: i64,
    pub old: bool,
}

#[derive(Default)]
struct State {
    wal_files: Vec<String>,
    segment_files: Vec<String>,
    wal_headers: HashMap<String, WalHeader>,
    next_wal: u64,
    next_segment: u64,
}

// --- operation log records -------------------------------------------------

enum Op {
    BumpWalCounter(u64),
    BumpSegmentCounter(u64),
    AppendWal(String),
    AppendSegment(String),
    SetWalHeader(WalHeader),
    DeleteSegment(String),
    DeleteWal(String),
}

impl Op {
    fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        match self {
            Op::BumpWalCounter(n) => {
                body.push(0);
                body.extend_from_slice(&n.to_be_bytes());
            }
            Op::BumpSegmentCounter(n) => {
                body.push(1);
                body.extend_from_slice(&n.to_be_bytes());
            }
            Op::AppendWal(name) => {
                body.push(2);
                write_string(&mut body, name);
            }
            Op::AppendSegment(name) => {
                body.push(3);
                write_string(&mut body, name);
            }
            Op::SetWalHeader(h) => {
                body.push(4);
                write_string(&mut body, &h.filename);
                body.extend_from_slice(&h.last_entry_id.to_be_bytes());
                body.push(h.old as u8);
            }
            Op::DeleteSegment(name) => {
                body.push(5);
                write_string(&mut body, name);
            }
            Op::DeleteWal(name) => {
                body.push(6);
                write_string(&mut body, name);
            }
        }
        let crc = crc32c::crc32c(&body);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc.to_be_bytes());
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut cursor = body;
        let tag = take_u8(&mut cursor)?;
        Ok(match tag {
            0 => Op::BumpWalCounter(take_u64(&mut cursor)?),
            1 => Op::BumpSegmentCounter(take_u64(&mut cursor)?),
            2 => Op::AppendWal(take_string(&mut cursor)?),
            3 => Op::AppendSegment(take_string(&mut cursor)?),
            4 => {
                let filename = take_string(&mut cursor)?;
                let last_entry_id = take_i64(&mut cursor)?;
                let old = take_u8(&mut cursor)? != 0;
                Op::SetWalHeader(WalHeader { filename, last_entry_id, old })
            }
            5 => Op::DeleteSegment(take_string(&mut cursor)?),
            6 => Op::DeleteWal(take_string(&mut cursor)?),
            other => return Err(Error::ManifestInconsistent(format!("unknown op tag {other}"))),
        })
    }

    fn apply(self, state: &mut State) {
        match self {
            Op::BumpWalCounter(n) => state.next_wal = state.next_wal.max(n),
            Op::BumpSegmentCounter(n) => state.next_segment = state.next_segment.max(n),
            Op::AppendWal(name) => state.wal_files.push(name),
            Op::AppendSegment(name) => state.segment_files.push(name),
            Op::SetWalHeader(h) => {
                state.wal_headers.insert(h.filename.clone(), h);
            }
            Op::DeleteSegment(name) => state.segment_files.retain(|f| f != &name),
            Op::DeleteWal(name) => {
                state.wal_files.retain(|f| f != &name);
                state.wal_headers.remove(&name);
            }
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn take_u8(cursor: &mut &[u8]) -> Result<u8> {
    let (&b, tail) = cursor.split_first().ok_or_else(|| Error::ManifestInconsistent("truncated op".into()))?;
    *cursor = tail;
    Ok(b)
}

fn take_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(Error::ManifestInconsistent("truncated op".into()));
    }
    let (head, tail) = cursor.split_at(4);
    *cursor = tail;
    Ok(u32::from_be_bytes(head.try_into().unwrap()))
}

fn take_u64(cursor: &mut &[u8]) -> Result<u64> {
    if cursor.len() < 8 {
        return Err(Error::ManifestInconsistent("truncated op".into()));
    }
    let (head, tail) = cursor.split_at(8);
    *cursor = tail;
    Ok(u64::from_be_bytes(head.try_into().unwrap()))
}

fn take_i64(cursor: &mut &[u8]) -> Result<i64> {
    take_u64(cursor).map(|v| v as i64)
}

fn take_string(cursor: &mut &[u8]) -> Result<String> {
    let len = take_u32(cursor)? as usize;
    if cursor.len() < len {
        return Err(Error::ManifestInconsistent("truncated op".into()));
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    String::from_utf8(head.to_vec()).map_err(|e| Error::ManifestInconsistent(e.to_string()))
}

/// Replay the operation log at `path`, returning the reconstructed state.
fn replay(path: &Path) -> Result<State> {
    let mut state = State::default();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(state),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read(&mut len_buf)? {
            0 => break,
            4 => {}
            _ => return Err(Error::ManifestInconsistent("truncated manifest log header".into())),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let stored = u32::from_be_bytes(crc_buf);
        if crc32c::crc32c(&body) != stored {
            return Err(Error::ManifestInconsistent("manifest log checksum mismatch".into()));
        }
        Op::decode(&body)?.apply(&mut state);
    }
    Ok(state)
}

struct Actor {
    log_file: File,
    state: State,
}

impl Actor {
    fn persist(&mut self, op: Op) -> Result<()> {
        let mut buf = Vec::new();
        op.encode(&mut buf);
        self.log_file.write_all(&buf)?;
        self.log_file.sync_data()?;
        // Apply only after fsync succeeds, so a crash mid-write never makes
        // in-memory state diverge from what a subsequent replay would
        // reconstruct.
        op.apply(&mut self.state);
        Ok(())
    }
}

type Job = Box<dyn FnOnce(&mut Actor) + Send>;

/// Handle to the manifest actor thread.
pub struct Manifest {
    tx: Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

impl Manifest {
    pub fn open(manifest_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(manifest_dir)?;
        let log_path = manifest_dir.join(LOG_FILE_NAME);
        let state = replay(&log_path)?;
        let log_file = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let (tx, rx): (Sender<Job>, Receiver<Job>) = crossbeam_channel::unbounded();
        let mut actor = Actor { log_file, state };
        let handle = std::thread::Builder::new()
            .name("streamlog-manifest".into())
            .spawn(move || {
                for job in rx {
                    job(&mut actor);
                }
            })
            .expect("failed to spawn manifest thread");

        Ok(Self { tx, handle: Some(handle) })
    }

    fn call<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&mut Actor) -> T + Send + 'static,
    {
        let (rtx, rrx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move |actor| {
            let _ = rtx.send(f(actor));
        });
        self.tx.send(job).expect("manifest thread is gone");
        rrx.recv().expect("manifest thread dropped reply channel")
    }

    pub fn get_wal_files(&self) -> Vec<String> {
        self.call(|a| a.state.wal_files.clone())
    }

    pub fn get_segment_files(&self) -> Vec<String> {
        self.call(|a| a.state.segment_files.clone())
    }

    pub fn get_wal_header(&self, filename: &str) -> Option<WalHeader> {
        let filename = filename.to_string();
        self.call(move |a| a.state.wal_headers.get(&filename).cloned())
    }

    pub fn set_wal_header(&self, header: WalHeader) -> Result<()> {
        self.call(move |a| a.persist(Op::SetWalHeader(header)))
    }

    /// Reserve and return the filename for the next journal, persisting the
    /// counter bump so it is never reused even if the journal itself never
    /// ends up being appended (e.g. due to a crash right after).
    pub fn get_next_wal(&self) -> Result<String> {
        self.call(|a| {
            let n = a.state.next_wal + 1;
            a.persist(Op::BumpWalCounter(n))?;
            Ok(format!("{n}.wal"))
        })
    }

    pub fn get_next_segment(&self) -> Result<String> {
        self.call(|a| {
            let n = a.state.next_segment + 1;
            a.persist(Op::BumpSegmentCounter(n))?;
            Ok(format!("{n}.seg"))
        })
    }

    pub fn append_wal(&self, filename: String) -> Result<()> {
        self.call(move |a| a.persist(Op::AppendWal(filename)))
    }

    pub fn append_segment(&self, filename: String) -> Result<()> {
        self.call(move |a| a.persist(Op::AppendSegment(filename)))
    }

    pub fn delete_segment(&self, filename: String) -> Result<()> {
        self.call(move |a| a.persist(Op::DeleteSegment(filename)))
    }

    pub fn delete_wal(&self, filename: String) -> Result<()> {
        self.call(move |a| a.persist(Op::DeleteWal(filename)))
    }

    pub fn close(&mut self) {
        // Dropping the last sender causes the actor's `for job in rx` loop
        // to terminate; join so the thread's file handle is released
        // before `close` returns.
        if let Some(handle) = self.handle.take() {
            drop(std::mem::replace(&mut self.tx, crossbeam_channel::unbounded().0));
            let _ = handle.join();
            debug!("manifest thread stopped");
        }
    }
}

impl Drop for Manifest {
    fn drop(&mut self) {
        self.close();
    }
}
