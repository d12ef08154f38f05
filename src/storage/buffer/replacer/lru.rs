use linked_hash_map::LinkedHashMap;
use crate::common::types::FrameId;

/// LRU page replacement policy over the unpinned resident frames.
///
/// Insertion order doubles as recency order: front of the map is the
/// least-recently unpinned frame, back is the most recent. Every operation is
/// O(1). The replacer carries no lock of its own; it is owned by the buffer
/// pool's mutex.
pub struct LruReplacer {
    capacity: usize,
    frames: LinkedHashMap<FrameId, ()>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: LinkedHashMap::with_capacity(capacity),
        }
    }

    /// Remove and return the least-recently-used frame, if any.
    pub fn victim(&mut self) -> Option<FrameId> {
        self.frames.pop_front().map(|(frame_id, ())| frame_id)
    }

    /// A pinned frame is no longer a replacement candidate.
    pub fn pin(&mut self, frame_id: FrameId) {
        self.frames.remove(&frame_id);
    }

    /// Track a frame whose pin count dropped to zero. Re-unpinning a tracked
    /// frame keeps its position; the order is set by the first unpin.
    pub fn unpin(&mut self, frame_id: FrameId) {
        if self.frames.contains_key(&frame_id) {
            return;
        }
        if self.frames.len() == self.capacity {
            return;
        }
        self.frames.insert(frame_id, ());
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_order_is_lru() {
        let mut replacer = LruReplacer::new(7);
        for frame_id in [1, 2, 3] {
            replacer.unpin(frame_id);
        }
        assert_eq!(replacer.len(), 3);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_pin_removes_candidate() {
        let mut replacer = LruReplacer::new(7);
        replacer.unpin(1);
        replacer.unpin(2);

        replacer.pin(1);
        // pinning an untracked frame is a no-op
        replacer.pin(9);

        assert_eq!(replacer.len(), 1);
        assert_eq!(replacer.victim(), Some(2));
    }

    #[test]
    fn test_reunpin_keeps_position() {
        let mut replacer = LruReplacer::new(7);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(1);

        assert_eq!(replacer.victim(), Some(1));
    }

    #[test]
    fn test_unpin_rejected_at_capacity() {
        let mut replacer = LruReplacer::new(2);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);

        assert_eq!(replacer.len(), 2);
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), None);
    }
}
