//! End-to-end scenarios against a real on-disk [`streamlog::Store`].
//!
//! Scale mirrors the shape of the scenarios this crate's spec describes
//! (single round-trip, crash recovery, cross-boundary reads, watchers,
//! multi-stream integrity, GC) rather than their exact record counts;
//! the properties under test do not depend on volume, and keeping the
//! suite fast matters more than matching a six-figure record count.

use std::io::Read;

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use streamlog::{Options, Store};

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

/// S1: single-entry round-trip, surviving a close/reopen.
#[test]
fn s1_single_entry_round_trip() {
    let dir = tempdir().unwrap();
    let opts = Options::new(dir.path());

    let store = Store::open(opts.clone()).unwrap();
    let new_end = store.append(1, b"hello world".to_vec(), -1).unwrap();
    assert_eq!(new_end, 11);
    assert_eq!(store.end(1), Some(11));

    let mut reader = store.reader(1).unwrap();
    assert_eq!(reader.read_all().unwrap(), b"hello world");
    store.close().unwrap();
    drop(store);

    let store = Store::open(opts).unwrap();
    assert_eq!(store.end(1), Some(11));
}

/// S2 (scaled down): many small appends across several close/reopen
/// cycles must preserve the exact durable end every time.
#[test]
fn s2_crash_recovery_at_volume() {
    enable_logging();
    let dir = tempdir().unwrap();
    let opts = Options::new(dir.path()).with_max_mstream_table_size(64 * 1024);

    const RECORD: &[u8] = b"hello world,";
    const PER_APPEND: usize = 10;
    const APPENDS_PER_ROUND: i64 = 2_000;
    const ROUNDS: i64 = 4;

    let payload: Vec<u8> = RECORD.repeat(PER_APPEND);
    let expected_end = APPENDS_PER_ROUND * ROUNDS * payload.len() as i64;

    for _ in 0..ROUNDS {
        let store = Store::open(opts.clone()).unwrap();
        for _ in 0..APPENDS_PER_ROUND {
            store.append(1, payload.clone(), -1).unwrap();
        }
        store.close().unwrap();
    }

    let store = Store::open(opts).unwrap();
    assert_eq!(store.end(1), Some(expected_end));
}

/// S3: reading a stream that straddles many memstream/segment boundaries
/// reproduces exactly the bytes that were written, verified by CRC-32.
#[test]
fn s3_cross_boundary_read_matches_crc() {
    let dir = tempdir().unwrap();
    let opts = Options::new(dir.path()).with_max_mstream_table_size(64 * 1024);
    let store = Store::open(opts).unwrap();

    let record = b"hello world,".repeat(10);
    let mut source = Vec::new();
    for _ in 0..5_000 {
        store.append(1, record.clone(), -1).unwrap();
        source.extend_from_slice(&record);
    }

    let mut reader = store.reader(1).unwrap();
    let read_back = reader.read_all().unwrap();
    assert_eq!(crc32(&read_back), crc32(&source));
    assert_eq!(read_back.len(), source.len());
}

/// S4: a watcher registered after some history fires on the next append
/// and the reader observes the newly appended bytes.
#[test]
fn s4_watcher_fires_on_append() {
    let dir = tempdir().unwrap();
    let store = Store::open(Options::new(dir.path())).unwrap();

    store.append(1, b"hello world".to_vec(), -1).unwrap();
    let mut reader = store.reader(1).unwrap();
    assert_eq!(reader.read_all().unwrap(), b"hello world");

    let watcher = store.watcher(1);
    store.append(1, b"hello world2".to_vec(), -1).unwrap();

    let new_end = watcher.watch().expect("watcher channel open");
    assert_eq!(new_end, 23);
    assert_eq!(reader.read_all().unwrap(), b"hello world2");
}

/// S5: many independent streams written round-robin must each read back
/// exactly their own bytes, uncorrupted by the others.
#[test]
fn s5_multi_stream_integrity() {
    let dir = tempdir().unwrap();
    let opts = Options::new(dir.path()).with_max_mstream_table_size(1024 * 1024);
    let store = Store::open(opts).unwrap();

    const STREAMS: i64 = 200;
    const ROUNDS: usize = 50;
    let payload = b"the quick brown fox jumps over the lazy dog".to_vec();

    for _ in 0..ROUNDS {
        for stream_id in 0..STREAMS {
            store.append(stream_id, payload.clone(), -1).unwrap();
        }
    }

    let mut reader = store.reader(100).unwrap();
    let read_back = reader.read_all().unwrap();
    let expected = payload.repeat(ROUNDS);
    assert_eq!(crc32(&read_back), crc32(&expected));
}

/// S6 (black-box half): `gc()` is safe to call under a workload that
/// crosses several flush boundaries but never exceeds `max_segment_count`,
/// and every stream remains fully readable afterwards. The boundary
/// behavior of retention actually *pruning* segments (and the resulting
/// loss of their byte range, which `gc()`'s segment-count-bounded design
/// makes an explicit, documented trade-off rather than a bug) is exercised
/// as a white-box test in `store.rs`, since the public API has no way to
/// observe segment count directly.
#[test]
fn s6_gc_is_safe_under_churn() {
    let dir = tempdir().unwrap();
    let opts = Options::new(dir.path()).with_max_mstream_table_size(64 * 1024);
    let store = Store::open(opts).unwrap();

    const STREAMS: i64 = 50;
    const ROUNDS: usize = 20;
    let payload = vec![7u8; 256];

    for _ in 0..ROUNDS {
        for stream_id in 0..STREAMS {
            store.append(stream_id, payload.clone(), -1).unwrap();
        }
    }

    store.gc().unwrap();
    store.gc().unwrap(); // idempotent: a second call with nothing new to collect is a no-op.

    for stream_id in 0..STREAMS {
        let mut reader = store.reader(stream_id).unwrap();
        let read_back = reader.read_all().unwrap();
        assert_eq!(read_back.len(), payload.len() * ROUNDS);
        assert_eq!(crc32(&read_back), crc32(&payload.repeat(ROUNDS)));
    }
}

/// Boundary: reading exactly at `end` returns zero bytes rather than an
/// error, and `std::io::Read` works the same way through the adapter impl.
#[test]
fn read_at_end_returns_eof() {
    let dir = tempdir().unwrap();
    let store = Store::open(Options::new(dir.path())).unwrap();
    store.append(1, b"abc".to_vec(), -1).unwrap();

    let mut reader = store.reader(1).unwrap();
    let mut buf = [0u8; 3];
    assert_eq!(reader.read(&mut buf).unwrap(), 0);

    let mut buf = [0u8; 8];
    assert_eq!(<streamlog::Reader as Read>::read(&mut reader, &mut buf).unwrap(), 0);
}

/// Offset conflicts are rejected before an entry ever reaches the journal,
/// and a correct expected offset still succeeds.
#[test]
fn offset_conflict_is_rejected() {
    let dir = tempdir().unwrap();
    let store = Store::open(Options::new(dir.path())).unwrap();
    store.append(1, b"abc".to_vec(), -1).unwrap();

    let err = store.append(1, b"xyz".to_vec(), 0).unwrap_err();
    assert!(matches!(err, streamlog::Error::OffsetConflict { expected: 0, actual: 3 }));

    assert_eq!(store.append(1, b"xyz".to_vec(), 3).unwrap(), 6);
}

/// Reading a stream that was never appended to fails with `NoSuchStream`.
#[test]
fn reader_of_unknown_stream_errors() {
    let dir = tempdir().unwrap();
    let store = Store::open(Options::new(dir.path())).unwrap();
    assert!(matches!(store.reader(42), Err(streamlog::Error::NoSuchStream(42))));
}

/// Boundary: a single batch large enough to cross `max_wal_size` rotates
/// the journal between entries rather than letting the whole batch land
/// in one over-threshold file. Every record submitted must still be
/// durable and readable after recovery, split across more than one WAL
/// file.
#[test]
fn wal_rotates_mid_batch_at_max_wal_size() {
    let dir = tempdir().unwrap();
    let opts = Options::new(dir.path()).with_max_wal_size(4 * 1024);
    let store = Store::open(opts.clone()).unwrap();

    let payload = vec![5u8; 200];
    const COUNT: i64 = 200;

    // Submit the whole batch without waiting on any callback first, so the
    // journal writer drains them all as one `take()` batch.
    let mut rxs = Vec::with_capacity(COUNT as usize);
    for _ in 0..COUNT {
        let (tx, rx) = std::sync::mpsc::channel();
        store
            .async_append(
                1,
                payload.clone(),
                -1,
                Box::new(move |end, result| {
                    let _ = tx.send(result.map(|()| end));
                }),
            )
            .unwrap();
        rxs.push(rx);
    }
    for rx in rxs {
        rx.recv().unwrap().unwrap();
    }

    let wal_files = std::fs::read_dir(&opts.wal_dir).unwrap().count();
    assert!(
        wal_files > 1,
        "a batch this large at such a small max_wal_size must rotate the journal mid-batch"
    );

    let expected_end = COUNT * payload.len() as i64;
    assert_eq!(store.end(1), Some(expected_end));
    store.close().unwrap();

    let store = Store::open(opts).unwrap();
    assert_eq!(store.end(1), Some(expected_end));
    let mut reader = store.reader(1).unwrap();
    assert_eq!(reader.read_all().unwrap(), payload.repeat(COUNT as usize));
}

/// Random-sized payloads, written at a small block size so most of them
/// straddle one or more page boundaries, must all read back byte-exact.
#[test]
fn random_sized_payloads_read_back_exact() {
    use rand::Rng;

    let dir = tempdir().unwrap();
    let opts = Options::new(dir.path()).with_block_size(64);
    let store = Store::open(opts).unwrap();

    let mut rng = rand::thread_rng();
    let mut expected = Vec::new();
    for _ in 0..300 {
        let len = rng.gen_range(0..300);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        store.append(1, payload.clone(), -1).unwrap();
        expected.extend_from_slice(&payload);
    }

    let mut reader = store.reader(1).unwrap();
    assert_eq!(reader.read_all().unwrap(), expected);
}

/// Recovery idempotence: repeatedly reopening a store with no writes in
/// between yields identical end offsets and byte output every time.
#[test]
fn recovery_is_idempotent() {
    let dir = tempdir().unwrap();
    let opts = Options::new(dir.path());

    {
        let store = Store::open(opts.clone()).unwrap();
        for i in 0..500 {
            store.append(1, format!("record-{i}").into_bytes(), -1).unwrap();
        }
        store.close().unwrap();
    }

    let mut last_end = None;
    let mut last_bytes = None;
    for _ in 0..3 {
        let store = Store::open(opts.clone()).unwrap();
        let end = store.end(1);
        let bytes = store.reader(1).unwrap().read_all().unwrap();
        if let Some(prev) = last_end {
            assert_eq!(end, prev);
        }
        if let Some(prev) = &last_bytes {
            assert_eq!(&bytes, prev);
        }
        last_end = Some(end);
        last_bytes = Some(bytes);
        store.close().unwrap();
    }
}
