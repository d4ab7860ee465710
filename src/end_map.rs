//! `stream_id -> (end, ver)`: the authoritative durable end offset per
//! stream, version-stamped so a stale update from an older segment never
//! overwrites a newer memstream's view.

use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Default)]
pub struct EndMap {
    inner: RwLock<HashMap<i64, (i64, u64)>>,
}

impl EndMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream_id: i64) -> Option<(i64, u64)> {
        self.inner.read().get(&stream_id).copied()
    }

    /// Set `stream_id`'s end to `(end, ver)`, unless a higher-or-equal
    /// `ver` is already recorded, in which case this update is stale and
    /// ignored.
    pub fn set(&self, stream_id: i64, end: i64, ver: u64) {
        let mut inner = self.inner.write();
        match inner.get(&stream_id) {
            Some(&(_, cur_ver)) if cur_ver > ver => {}
            _ => {
                inner.insert(stream_id, (end, ver));
            }
        }
    }
}
