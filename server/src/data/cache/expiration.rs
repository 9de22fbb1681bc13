//! Expiration-ordered queue shared by the in-process caches
//!
//! The queue never owns cache entries. Each push carries a sequence number
//! that the owning map stores next to its value; a heap item whose sequence
//! no longer matches the map is stale and gets skipped. Refreshing an entry is
//! therefore a push, never a heap update.
//!
//! Lock order: the heap lock may be held while the owner touches its map, but
//! the owner must not push while holding a map guard.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use tokio::time::Instant;

/// Heap slack before stale items are compacted away
const COMPACT_SLACK: usize = 64;

struct Expiration<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Expiration<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<K> Eq for Expiration<K> {}

impl<K> PartialOrd for Expiration<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Expiration<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

/// Min-heap of expiration instants keyed by cache key
pub struct ExpirationQueue<K> {
    heap: Mutex<BinaryHeap<Reverse<Expiration<K>>>>,
    next_seq: AtomicU64,
}

impl<K> Default for ExpirationQueue<K> {
    fn default() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
        }
    }
}

impl<K> ExpirationQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a sequence number for an entry about to be stored
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    pub fn push(&self, key: K, at: Instant, seq: u64) {
        self.heap.lock().push(Reverse(Expiration { at, seq, key }));
    }

    /// Pop every item due at or before `now`, handing each to `evict`.
    pub fn drain_expired(&self, now: Instant, mut evict: impl FnMut(K, u64)) {
        let mut heap = self.heap.lock();
        while heap.peek().is_some_and(|Reverse(item)| item.at <= now) {
            if let Some(Reverse(item)) = heap.pop() {
                evict(item.key, item.seq);
            }
        }
    }

    /// Pop items oldest first until `evict` reports that a live entry was
    /// removed. Returns false when the queue ran dry first.
    pub fn pop_oldest(&self, mut evict: impl FnMut(K, u64) -> bool) -> bool {
        let mut heap = self.heap.lock();
        while let Some(Reverse(item)) = heap.pop() {
            if evict(item.key, item.seq) {
                return true;
            }
        }
        false
    }

    /// Drop stale items once the heap has grown well past the live entry count.
    pub fn compact(&self, live: usize, is_live: impl Fn(&K, u64) -> bool) {
        let mut heap = self.heap.lock();
        if heap.len() <= live.saturating_mul(2) + COMPACT_SLACK {
            return;
        }
        let before = heap.len();
        heap.retain(|Reverse(item)| is_live(&item.key, item.seq));
        tracing::trace!(before, after = heap.len(), "Compacted expiration queue");
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn clear(&self) {
        self.heap.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_drain_expired_in_order() {
        let queue = ExpirationQueue::new();
        let now = Instant::now();
        queue.push("late", now + Duration::from_secs(10), queue.next_seq());
        queue.push("early", now + Duration::from_secs(1), queue.next_seq());
        queue.push("due", now, queue.next_seq());

        let mut drained = Vec::new();
        queue.drain_expired(now + Duration::from_secs(1), |key, _| drained.push(key));
        assert_eq!(drained, vec!["due", "early"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_oldest_skips_stale_items() {
        let queue = ExpirationQueue::new();
        let now = Instant::now();
        let stale = queue.next_seq();
        queue.push("a", now, stale);
        let live = queue.next_seq();
        queue.push("a", now + Duration::from_secs(5), live);

        let mut seen = Vec::new();
        assert!(queue.pop_oldest(|key, seq| {
            seen.push((key, seq));
            seq == live
        }));
        assert_eq!(seen, vec![("a", stale), ("a", live)]);
        assert!(queue.is_empty());
        assert!(!queue.pop_oldest(|_, _| true));
    }

    #[test]
    fn test_compact_drops_stale_items() {
        let queue = ExpirationQueue::new();
        let now = Instant::now();
        for i in 0..200u64 {
            queue.push(i, now, queue.next_seq());
        }
        queue.compact(1, |key, _| *key == 0);
        assert_eq!(queue.len(), 1);
    }
}
