//! Delay-keyed suppression cache
//!
//! [`DelayLimiter::should_invoke`] answers true once per key per TTL window.
//! Expired keys are purged lazily on every call, and when the map grows past
//! its cardinality bound the single oldest key is evicted.
//!
//! Failed operations call [`DelayLimiter::invalidate`] so their key becomes
//! immediately retryable.

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::expiration::ExpirationQueue;
use crate::core::constants::{DEFAULT_LIMITER_CARDINALITY, DEFAULT_LIMITER_TTL_SECS};
use crate::data::error::DataError;

#[derive(Debug, Clone, Copy)]
struct Suppression {
    expires_at: Instant,
    seq: u64,
}

/// Builder for [`DelayLimiter`]
#[derive(Debug, Clone)]
pub struct DelayLimiterBuilder {
    expire_after: Duration,
    maximum_size: usize,
}

impl Default for DelayLimiterBuilder {
    fn default() -> Self {
        Self {
            expire_after: Duration::from_secs(DEFAULT_LIMITER_TTL_SECS),
            maximum_size: DEFAULT_LIMITER_CARDINALITY,
        }
    }
}

impl DelayLimiterBuilder {
    /// How long a key stays suppressed after its first invocation
    pub fn expire_after(mut self, expire_after: Duration) -> Self {
        self.expire_after = expire_after;
        self
    }

    /// Soft cap on the number of suppressed keys
    pub fn maximum_size(mut self, maximum_size: usize) -> Self {
        self.maximum_size = maximum_size;
        self
    }

    pub fn build<K>(self) -> Result<DelayLimiter<K>, DataError>
    where
        K: Eq + Hash + Clone,
    {
        if self.expire_after.is_zero() {
            return Err(DataError::invalid_argument("expire_after must be positive"));
        }
        if self.maximum_size == 0 {
            return Err(DataError::invalid_argument("maximum_size must be positive"));
        }
        Ok(DelayLimiter {
            expire_after: self.expire_after,
            maximum_size: self.maximum_size,
            entries: DashMap::new(),
            queue: ExpirationQueue::new(),
        })
    }
}

/// Gate that lets an action through once per key per TTL window
pub struct DelayLimiter<K> {
    expire_after: Duration,
    maximum_size: usize,
    entries: DashMap<K, Suppression>,
    queue: ExpirationQueue<K>,
}

impl<K> std::fmt::Debug for DelayLimiter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayLimiter")
            .field("expire_after", &self.expire_after)
            .field("maximum_size", &self.maximum_size)
            .finish_non_exhaustive()
    }
}

impl DelayLimiter<()> {
    pub fn builder() -> DelayLimiterBuilder {
        DelayLimiterBuilder::default()
    }
}

impl<K> DelayLimiter<K>
where
    K: Eq + Hash + Clone,
{
    /// True when `key` has not been invoked within the TTL window.
    ///
    /// A true answer marks the key as invoked until the window elapses or it
    /// is invalidated.
    pub fn should_invoke(&self, key: &K) -> bool {
        let now = Instant::now();
        self.purge_expired(now);

        let expires_at = now + self.expire_after;
        let seq = self.queue.next_seq();
        let fresh = Suppression { expires_at, seq };
        let admitted = match self.entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
            // expired but not yet purged by a concurrent caller
            Entry::Occupied(mut occupied) if occupied.get().expires_at <= now => {
                occupied.insert(fresh);
                true
            }
            Entry::Occupied(_) => false,
        };
        if !admitted {
            return false;
        }

        self.queue.push(key.clone(), expires_at, seq);
        if self.entries.len() > self.maximum_size {
            self.evict_oldest();
        }
        true
    }

    /// Forget `key` so the next `should_invoke` returns true.
    pub fn invalidate(&self, key: &K) {
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

    fn purge_expired(&self, now: Instant) {
        self.queue.drain_expired(now, |key, seq| {
            self.entries.remove_if(&key, |_, entry| entry.seq == seq);
        });
        self.queue.compact(self.entries.len(), |key, seq| {
            self.entries.get(key).is_some_and(|entry| entry.seq == seq)
        });
    }

    fn evict_oldest(&self) {
        self.queue.pop_oldest(|key, seq| {
            self.entries
                .remove_if(&key, |_, entry| entry.seq == seq)
                .is_some()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(ttl_secs: u64, max: usize) -> DelayLimiter<String> {
        DelayLimiter::builder()
            .expire_after(Duration::from_secs(ttl_secs))
            .maximum_size(max)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_zero_values() {
        let err = DelayLimiter::builder()
            .expire_after(Duration::ZERO)
            .build::<String>()
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidArgument(_)));

        let err = DelayLimiter::builder()
            .maximum_size(0)
            .build::<String>()
            .unwrap_err();
        assert!(err.to_string().contains("maximum_size"));
    }

    #[tokio::test]
    async fn test_suppresses_within_window() {
        let limiter = limiter(60, 100);
        let key = "frontend".to_string();
        assert!(limiter.should_invoke(&key));
        assert!(!limiter.should_invoke(&key));
        assert!(limiter.should_invoke(&"backend".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_ttl() {
        let limiter = limiter(1, 100);
        let key = "frontend".to_string();
        assert!(limiter.should_invoke(&key));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!limiter.should_invoke(&key));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(limiter.should_invoke(&key));
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_allows_retry() {
        let limiter = limiter(60, 100);
        let key = "frontend".to_string();
        assert!(limiter.should_invoke(&key));
        limiter.invalidate(&key);
        assert!(limiter.should_invoke(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_oldest_over_cardinality() {
        let limiter = limiter(60, 3);
        for i in 0..4 {
            assert!(limiter.should_invoke(&format!("svc-{i}")));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(limiter.len(), 3);

        // svc-0 was the oldest and is invokable again
        assert!(limiter.should_invoke(&"svc-0".to_string()));
        assert!(!limiter.should_invoke(&"svc-3".to_string()));
    }

    #[tokio::test]
    async fn test_clear() {
        let limiter = limiter(60, 10);
        let key = "a".to_string();
        limiter.should_invoke(&key);
        limiter.clear();
        assert!(limiter.is_empty());
        assert!(limiter.should_invoke(&key));
    }
}
