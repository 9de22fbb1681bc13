//! Suppression of redundant writes
//!
//! Wraps a call factory with a [`DelayLimiter`]. Inputs seen within the TTL
//! window get a completed no-op call; issued calls give their key back to the
//! limiter if they fail or are canceled, so the write can be retried.

use std::hash::Hash;
use std::sync::Arc;

use super::Call;
use crate::data::cache::DelayLimiter;

type Factory<K> = Box<dyn Fn(K) -> Call<()> + Send + Sync>;

pub struct DeduplicatingCallFactory<K> {
    limiter: Arc<DelayLimiter<K>>,
    factory: Factory<K>,
}

impl<K> DeduplicatingCallFactory<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new<F>(limiter: DelayLimiter<K>, factory: F) -> Self
    where
        F: Fn(K) -> Call<()> + Send + Sync + 'static,
    {
        Self {
            limiter: Arc::new(limiter),
            factory: Box::new(factory),
        }
    }

    /// A call that writes `input`, or a no-op when it was written recently.
    pub fn create(&self, input: K) -> Call<()> {
        if !self.limiter.should_invoke(&input) {
            return Call::create(());
        }
        let limiter = self.limiter.clone();
        let key = input.clone();
        (self.factory)(input).release_on_failure(move || limiter.invalidate(&key))
    }

    pub fn clear(&self) {
        self.limiter.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::error::DataError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn factory(writes: Arc<AtomicUsize>, fail: Arc<AtomicBool>) -> DeduplicatingCallFactory<String> {
        let limiter = DelayLimiter::builder()
            .expire_after(Duration::from_secs(60))
            .maximum_size(100)
            .build()
            .unwrap();
        DeduplicatingCallFactory::new(limiter, move |name: String| {
            let writes = writes.clone();
            let fail = fail.clone();
            Call::new(format!("insert-{name}"), move |_| {
                let writes = writes.clone();
                let fail = fail.clone();
                async move {
                    if fail.load(Ordering::SeqCst) {
                        return Err(DataError::timeout("memory", 10));
                    }
                    writes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        })
    }

    #[tokio::test]
    async fn test_second_write_is_suppressed() {
        let writes = Arc::new(AtomicUsize::new(0));
        let factory = factory(writes.clone(), Arc::new(AtomicBool::new(false)));

        factory.create("frontend".into()).execute().await.unwrap();
        factory.create("frontend".into()).execute().await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried() {
        let writes = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(true));
        let factory = factory(writes.clone(), fail.clone());

        assert!(factory.create("frontend".into()).execute().await.is_err());
        fail.store(false, Ordering::SeqCst);
        factory.create("frontend".into()).execute().await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_canceled_write_is_retried() {
        let writes = Arc::new(AtomicUsize::new(0));
        let factory = factory(writes.clone(), Arc::new(AtomicBool::new(false)));

        let call = factory.create("frontend".into());
        call.cancel();
        assert!(call.execute().await.unwrap_err().is_canceled());

        factory.create("frontend".into()).execute().await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_forgets_suppression() {
        let writes = Arc::new(AtomicUsize::new(0));
        let factory = factory(writes.clone(), Arc::new(AtomicBool::new(false)));

        factory.create("frontend".into()).execute().await.unwrap();
        factory.clear();
        factory.create("frontend".into()).execute().await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }
}
