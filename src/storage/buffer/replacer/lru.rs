use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// Least-recently-used replacement policy over buffer pool frames.
///
/// The replacer tracks exactly the frames that are eligible for eviction:
/// a frame enters on `unpin` and leaves on `pin` or `victim`. Recency is
/// insertion order; `victim` pops the LRU end.
pub struct LruReplacer {
    inner: Mutex<LinkedHashMap<FrameId, ()>>,
    capacity: usize,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LinkedHashMap::with_capacity(capacity)),
            capacity,
        }
    }

    /// Remove and return the least recently unpinned frame.
    pub fn victim(&self) -> Option<FrameId> {
        self.inner.lock().pop_front().map(|(frame_id, ())| frame_id)
    }

    /// A pinned frame is no longer an eviction candidate.
    pub fn pin(&self, frame_id: FrameId) {
        self.inner.lock().remove(&frame_id);
    }

    /// Register a frame as the most recently used candidate. No-op if the
    /// frame is already tracked or the replacer is at capacity.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.contains_key(&frame_id) || inner.len() >= self.capacity {
            return;
        }
        inner.insert(frame_id, ());
    }

    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_is_lru_order() {
        let replacer = LruReplacer::new(4);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_pin_removes_candidate() {
        let replacer = LruReplacer::new(4);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.pin(1);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.victim(), Some(2));

        // Pinning an untracked frame is a no-op
        replacer.pin(9);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_unpin_is_idempotent() {
        let replacer = LruReplacer::new(4);
        replacer.unpin(5);
        replacer.unpin(5);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.victim(), Some(5));
    }

    #[test]
    fn test_capacity_bound() {
        let replacer = LruReplacer::new(2);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), None);
    }
}
