//! Tracks every installed [`Segment`] in manifest (oldest-first) order, so
//! garbage collection can pick surplus segments without scanning the index.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::segment::Segment;

#[derive(Default)]
pub struct SegmentRegistry {
    inner: RwLock<Vec<Arc<Segment>>>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, segment: Arc<Segment>) {
        self.inner.write().push(segment);
    }

    pub fn remove(&self, segment: &Arc<Segment>) {
        self.inner.write().retain(|s| !Arc::ptr_eq(s, segment));
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// The oldest `n` segments still tracked, oldest first.
    pub fn oldest(&self, n: usize) -> Vec<Arc<Segment>> {
        self.inner.read().iter().take(n).cloned().collect()
    }

    /// Highest `last_entry_id` across every tracked segment, if any.
    pub fn max_last_entry_id(&self) -> Option<i64> {
        self.inner.read().iter().map(|s| s.last_entry_id()).max()
    }

    /// Highest `ver` across every tracked segment, if any.
    pub fn max_ver(&self) -> Option<u64> {
        self.inner.read().iter().map(|s| s.ver()).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mstream_table::MemstreamTable;

    fn sample_segment(dir: &std::path::Path, name: &str, last_entry_id: i64, ver: u64) -> Arc<Segment> {
        let path = dir.join(name);
        let mut table = MemstreamTable::new(ver);
        table.get_or_create(1, 0, 16).write(-1, b"x");
        crate::segment::write_segment(&path, &table, last_entry_id, ver).unwrap();
        Arc::new(Segment::open(&path).unwrap())
    }

    #[test]
    fn oldest_returns_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let a = sample_segment(dir.path(), "1.seg", 1, 1);
        let b = sample_segment(dir.path(), "2.seg", 2, 2);
        registry.insert(a.clone());
        registry.insert(b.clone());

        let oldest = registry.oldest(1);
        assert_eq!(oldest.len(), 1);
        assert!(Arc::ptr_eq(&oldest[0], &a));
        assert_eq!(registry.max_last_entry_id(), Some(2));
    }

    #[test]
    fn remove_drops_the_matching_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let a = sample_segment(dir.path(), "1.seg", 1, 1);
        registry.insert(a.clone());
        registry.remove(&a);
        assert!(registry.is_empty());
    }
}
