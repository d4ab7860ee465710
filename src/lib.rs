//! `streamlog`: an embedded, append-only, multi-stream log store.
//!
//! Clients identify independent byte streams by a 64-bit id and append
//! opaque payloads; the store durably persists each append behind a
//! write-ahead journal, assigns it a globally monotonic entry id, and later
//! serves sequential reads from any byte offset within any stream.
//!
//! [`Store::open`] recovers state from an existing data directory (or
//! creates one), then runs five dedicated threads for the lifetime of the
//! store: the journal writer, the committer, the flusher, the manifest, and
//! the watcher notifier. `Store` is the only public entry point; there is
//! no separate façade layer.

mod committer;
mod end_map;
mod entry;
mod error;
mod flusher;
mod index;
mod journal;
mod manifest;
mod mstream;
mod mstream_table;
mod queue;
mod reader;
mod segment;
mod segments;
mod store;
mod watcher;
mod wwriter;

/// Test-only helpers, enabled via the `test` feature so normal consumers
/// never pull in `env_logger`.
#[cfg(feature = "test")]
pub mod testing {
    /// Install an `env_logger` subscriber at `trace` level, suitable for
    /// `cargo test -- --nocapture`. Safe to call more than once (later
    /// calls are no-ops).
    pub fn enable_logging() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .format_timestamp(None)
            .is_test(true)
            .try_init();
    }
}

pub use entry::Callback;
pub use error::{Error, Result};
pub use reader::Reader;
pub use store::{Options, Store};
pub use watcher::Watcher;
