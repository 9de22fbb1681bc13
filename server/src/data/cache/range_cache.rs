//! Shared timestamp-range cache for gap widening
//!
//! Maps an [`IndexKey`] to the [`TimestampRange`] already known to be indexed
//! for it. Ranges only widen. Updates go through a compare-and-replace loop so
//! concurrent writers for the same key converge on the union of their
//! timestamps without either update being lost.
//!
//! The cardinality bound is soft: [`RangeCache::widen`] never evicts, and the
//! owner calls [`RangeCache::trim`] once per batch. Trimming removes expired
//! entries first, then the oldest ones until the cache is back under its cap.

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::expiration::ExpirationQueue;

/// Identity of one logical secondary-index entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub table: &'static str,
    pub partition_key: String,
    /// Low 64 bits of the trace id
    pub trace_id: u64,
}

impl IndexKey {
    pub fn new(table: &'static str, partition_key: impl Into<String>, trace_id: u64) -> Self {
        Self {
            table,
            partition_key: partition_key.into(),
            trace_id,
        }
    }
}

/// Inclusive microsecond range, `lo <= hi`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampRange {
    pub lo: u64,
    pub hi: u64,
}

impl TimestampRange {
    pub fn point(ts: u64) -> Self {
        Self { lo: ts, hi: ts }
    }

    /// Smallest range containing both `self` and `ts`
    pub fn widen(self, ts: u64) -> Self {
        Self {
            lo: self.lo.min(ts),
            hi: self.hi.max(ts),
        }
    }

    pub fn contains(&self, ts: u64) -> bool {
        self.lo <= ts && ts <= self.hi
    }
}

/// Result of folding one timestamp into the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Widening {
    /// No live range existed; one was created at `[ts, ts]`
    Created,
    /// The range grew on at least one end
    Widened,
    /// `ts` was already inside the range
    Unchanged,
}

impl Widening {
    pub fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

#[derive(Debug, Clone, Copy)]
struct RangeEntry {
    range: TimestampRange,
    expires_at: Instant,
    seq: u64,
}

/// Process-wide range cache, shared by every indexer of one storage instance
pub struct RangeCache {
    ttl: Duration,
    max_size: usize,
    entries: DashMap<IndexKey, RangeEntry>,
    queue: ExpirationQueue<IndexKey>,
}

impl std::fmt::Debug for RangeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeCache")
            .field("ttl", &self.ttl)
            .field("max_size", &self.max_size)
            .field("len", &self.entries.len())
            .finish()
    }
}

impl RangeCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            ttl,
            max_size,
            entries: DashMap::new(),
            queue: ExpirationQueue::new(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Fold `ts` into the range for `key`.
    ///
    /// Every touch slides the entry's expiration forward, including touches
    /// that leave the range unchanged.
    pub fn widen(&self, key: &IndexKey, ts: u64) -> Widening {
        loop {
            let now = Instant::now();
            let observed = self.entries.get(key).map(|entry| *entry);
            let outcome = match observed {
                None => self.put_if_absent(key, ts, now),
                Some(entry) if entry.expires_at <= now => {
                    self.replace(key, entry, TimestampRange::point(ts), now)
                        .then_some(Widening::Created)
                }
                Some(entry) => {
                    let widened = entry.range.widen(ts);
                    let outcome = if widened == entry.range {
                        Widening::Unchanged
                    } else {
                        Widening::Widened
                    };
                    self.replace(key, entry, widened, now).then_some(outcome)
                }
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
            // lost a race with another writer; re-read
        }
    }

    fn put_if_absent(&self, key: &IndexKey, ts: u64, now: Instant) -> Option<Widening> {
        let seq = self.queue.next_seq();
        let expires_at = now + self.ttl;
        let inserted = match self.entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(RangeEntry {
                    range: TimestampRange::point(ts),
                    expires_at,
                    seq,
                });
                true
            }
            Entry::Occupied(_) => false,
        };
        if !inserted {
            return None;
        }
        self.queue.push(key.clone(), expires_at, seq);
        Some(Widening::Created)
    }

    /// Replace `expected` with `range` only if the entry still holds `expected`.
    fn replace(&self, key: &IndexKey, expected: RangeEntry, range: TimestampRange, now: Instant) -> bool {
        let seq = self.queue.next_seq();
        let expires_at = now + self.ttl;
        let replaced = match self.entries.get_mut(key) {
            Some(mut current) if current.seq == expected.seq => {
                *current = RangeEntry {
                    range,
                    expires_at,
                    seq,
                };
                true
            }
            _ => false,
        };
        if replaced {
            self.queue.push(key.clone(), expires_at, seq);
        }
        replaced
    }

    /// Current live range for `key`
    pub fn get(&self, key: &IndexKey) -> Option<TimestampRange> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.range)
    }

    /// Evict expired entries, then the oldest ones until back under the cap.
    /// Returns the number of entries evicted.
    pub fn trim(&self) -> usize {
        let mut evicted = 0;
        self.queue.drain_expired(Instant::now(), |key, seq| {
            if self.entries.remove_if(&key, |_, entry| entry.seq == seq).is_some() {
                evicted += 1;
            }
        });
        while self.entries.len() > self.max_size {
            let removed = self.queue.pop_oldest(|key, seq| {
                self.entries
                    .remove_if(&key, |_, entry| entry.seq == seq)
                    .is_some()
            });
            if !removed {
                break;
            }
            evicted += 1;
        }
        self.queue.compact(self.entries.len(), |key, seq| {
            self.entries.get(key).is_some_and(|entry| entry.seq == seq)
        });
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.entries.len(), "Trimmed index range cache");
        }
        evicted
    }

    /// Forget the range for `key`, e.g. after its index write failed
    pub fn invalidate(&self, key: &IndexKey) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
