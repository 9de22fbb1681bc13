//! Single-shot asynchronous calls
//!
//! A [`Call`] wraps one unit of database work. It can be awaited directly with
//! [`Call::execute`] or handed to the runtime with [`Call::enqueue`], but only
//! once: retrying means cloning, which yields a fresh unexecuted call with the
//! same inputs.
//!
//! Cancellation is cooperative. Every call owns a [`CancellationToken`]; the
//! in-flight future is raced against it and dropped when it fires, which is
//! what stops the database operation. Mapped calls share their upstream's
//! token, so canceling the outer call cancels the work underneath it.

pub mod aggregate;
pub mod dedup;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::data::error::DataError;

pub use aggregate::{AggregateCall, Aggregator};
pub use dedup::DeduplicatingCallFactory;

/// Outcome of a call
pub type CallResult<T> = Result<T, DataError>;

type Runner<T> = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, CallResult<T>> + Send + Sync>;
type Hook = Arc<dyn Fn() + Send + Sync>;

/// One unit of asynchronous work producing `T`.
pub struct Call<T> {
    name: Arc<str>,
    run: Runner<T>,
    /// Invoked when the call is canceled before it completes
    cancel_hooks: Vec<Hook>,
    token: CancellationToken,
    executed: AtomicBool,
    completed: Arc<AtomicBool>,
}

impl<T: Send + 'static> Call<T> {
    /// Build a call from a future factory.
    ///
    /// The factory is invoked once per execution (clones invoke it again) and
    /// receives the token that cancels this execution.
    pub fn new<F, Fut>(name: impl Into<Arc<str>>, run: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult<T>> + Send + 'static,
    {
        let run: Runner<T> = Arc::new(move |token: CancellationToken| run(token).boxed());
        Self::from_parts(name.into(), run, Vec::new(), CancellationToken::new())
    }

    /// A call that completes immediately with `value`
    pub fn create(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new("constant", move |_| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    fn from_parts(
        name: Arc<str>,
        run: Runner<T>,
        cancel_hooks: Vec<Hook>,
        token: CancellationToken,
    ) -> Self {
        Self {
            name,
            run,
            cancel_hooks,
            token,
            executed: AtomicBool::new(false),
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the call on the current task and wait for its result.
    pub async fn execute(&self) -> CallResult<T> {
        if self.executed.swap(true, Ordering::SeqCst) {
            return Err(DataError::AlreadyExecuted(self.name.to_string()));
        }
        let result = drive(self.run.clone(), self.token.clone()).await;
        self.completed.store(true, Ordering::SeqCst);
        result
    }

    /// Schedule the call on the current Tokio runtime.
    ///
    /// `callback` is invoked exactly once, from a runtime worker, with the
    /// result. Misuse (second execution, no runtime) is reported through the
    /// callback as well, synchronously.
    pub fn enqueue<F>(&self, callback: F)
    where
        F: FnOnce(CallResult<T>) + Send + 'static,
    {
        if self.executed.swap(true, Ordering::SeqCst) {
            callback(Err(DataError::AlreadyExecuted(self.name.to_string())));
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.completed.store(true, Ordering::SeqCst);
                self.run_cancel_hooks();
                callback(Err(DataError::NoRuntime(self.name.to_string())));
                return;
            }
        };
        let run = self.run.clone();
        let token = self.token.clone();
        let completed = self.completed.clone();
        handle.spawn(async move {
            let result = drive(run, token).await;
            completed.store(true, Ordering::SeqCst);
            callback(result);
        });
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        if !self.completed.load(Ordering::SeqCst) {
            self.run_cancel_hooks();
        }
    }

    fn run_cancel_hooks(&self) {
        for hook in &self.cancel_hooks {
            hook();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Transform the eventual value.
    pub fn map<U, F>(self, f: F) -> Call<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.try_map(move |value| Ok(f(value)))
    }

    /// Transform the eventual value with a fallible function.
    pub fn try_map<U, F>(self, f: F) -> Call<U>
    where
        U: Send + 'static,
        F: Fn(T) -> CallResult<U> + Send + Sync + 'static,
    {
        let upstream = self.run;
        let f = Arc::new(f);
        let run: Runner<U> = Arc::new(move |token: CancellationToken| {
            let fut = upstream(token);
            let f = f.clone();
            async move { fut.await.and_then(|value| f(value)) }.boxed()
        });
        Call::reuse(self.name, run, self.cancel_hooks, self.token)
    }

    /// Chain a dependent call built from the eventual value.
    ///
    /// The inner call runs under this call's token, so canceling the outer
    /// call stops whichever stage is in flight.
    pub fn flat_map<U, F>(self, f: F) -> Call<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Call<U> + Send + Sync + 'static,
    {
        let upstream = self.run;
        let f = Arc::new(f);
        let run: Runner<U> = Arc::new(move |token: CancellationToken| {
            let fut = upstream(token.clone());
            let f = f.clone();
            async move {
                let value = fut.await?;
                let inner = f(value);
                inner.run_nested(token).await
            }
            .boxed()
        });
        Call::reuse(self.name, run, self.cancel_hooks, self.token)
    }

    /// Recover from a failure. Cancellation of this call is not routed here.
    pub fn handle_error<F>(self, f: F) -> Call<T>
    where
        F: Fn(DataError) -> CallResult<T> + Send + Sync + 'static,
    {
        let upstream = self.run;
        let f = Arc::new(f);
        let run: Runner<T> = Arc::new(move |token: CancellationToken| {
            let fut = upstream(token);
            let f = f.clone();
            async move { fut.await.or_else(|err| f(err)) }.boxed()
        });
        Call::reuse(self.name, run, self.cancel_hooks, self.token)
    }

    /// Run `hook` once when this call fails, is canceled before completing,
    /// or has its in-flight future dropped.
    ///
    /// A canceled execution releases through the cancel hooks only; the
    /// guard on the dropped future stands down once the token has fired.
    pub fn release_on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let hook: Hook = Arc::new(hook);
        let upstream = self.run;
        let on_failure = hook.clone();
        self.run = Arc::new(move |token: CancellationToken| {
            let mut guard = ReleaseGuard {
                hook: Some(on_failure.clone()),
                token: token.clone(),
            };
            let fut = upstream(token);
            async move {
                let result = fut.await;
                if result.is_ok() {
                    guard.disarm();
                }
                result
            }
            .boxed()
        });
        self.cancel_hooks.push(hook);
        self
    }

    fn reuse(name: Arc<str>, run: Runner<T>, cancel_hooks: Vec<Hook>, token: CancellationToken) -> Self {
        Self::from_parts(name, run, cancel_hooks, token)
    }

    /// Run under an outer token while still honoring this call's own token.
    async fn run_nested(self, outer: CancellationToken) -> CallResult<T> {
        if self.executed.swap(true, Ordering::SeqCst) {
            return Err(DataError::AlreadyExecuted(self.name.to_string()));
        }
        // The outer token only drops this future; the inner call's own
        // release hooks still have to run.
        let _cancel = CancelOnDrop(&self);
        let own = self.token.clone();
        let result = tokio::select! {
            biased;
            _ = own.cancelled() => Err(DataError::Canceled),
            result = (self.run)(outer) => result,
        };
        self.completed.store(true, Ordering::SeqCst);
        result
    }
}

impl<T: Send + 'static> Call<Vec<T>> {
    /// A call that completes immediately with an empty list
    pub fn empty_list() -> Self {
        Self::new("empty", |_| async { Ok(Vec::new()) })
    }
}

impl<T> Clone for Call<T> {
    /// A fresh, unexecuted call with the same inputs.
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            run: self.run.clone(),
            cancel_hooks: self.cancel_hooks.clone(),
            token: CancellationToken::new(),
            executed: AtomicBool::new(false),
            completed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<T> std::fmt::Debug for Call<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("name", &self.name)
            .field("executed", &self.executed.load(Ordering::SeqCst))
            .field("canceled", &self.token.is_cancelled())
            .finish()
    }
}

async fn drive<T: Send + 'static>(run: Runner<T>, token: CancellationToken) -> CallResult<T> {
    if token.is_cancelled() {
        return Err(DataError::Canceled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DataError::Canceled),
        result = run(token.clone()) => result,
    }
}

struct ReleaseGuard {
    hook: Option<Hook>,
    token: CancellationToken,
}

impl ReleaseGuard {
    fn disarm(&mut self) {
        self.hook = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        // A fired token means `cancel` already ran the hook
        if let Some(hook) = self.hook.take()
            && !self.token.is_cancelled()
        {
            hook();
        }
    }
}

/// Cancels a nested call whose future is dropped before it completes
struct CancelOnDrop<'a, T: Send + 'static>(&'a Call<T>);

impl<T: Send + 'static> Drop for CancelOnDrop<'_, T> {
    fn drop(&mut self) {
        if !self.0.completed.load(Ordering::SeqCst) {
            self.0.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_call(counter: Arc<AtomicUsize>) -> Call<usize> {
        Call::new("count", move |_| {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
        })
    }

    #[tokio::test]
    async fn test_execute_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let call = counting_call(counter.clone());

        assert_eq!(call.execute().await.unwrap(), 1);
        let err = call.execute().await.unwrap_err();
        assert!(matches!(err, DataError::AlreadyExecuted(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clone_is_fresh() {
        let counter = Arc::new(AtomicUsize::new(0));
        let call = counting_call(counter.clone());
        call.execute().await.unwrap();

        let retry = call.clone();
        assert_eq!(retry.execute().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_invokes_callback_once() {
        let call = Call::create(7u32);
        let (tx, rx) = tokio::sync::oneshot::channel();
        call.enqueue(move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap().unwrap(), 7);

        let (tx, rx) = tokio::sync::oneshot::channel();
        call.enqueue(move |result| {
            let _ = tx.send(result);
        });
        assert!(matches!(
            rx.await.unwrap(),
            Err(DataError::AlreadyExecuted(_))
        ));
    }

    #[test]
    fn test_enqueue_without_runtime_reports_error() {
        let released = Arc::new(AtomicUsize::new(0));
        let r = released.clone();
        let call = Call::create(1u8).release_on_failure(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let slot = seen.clone();
        call.enqueue(move |result| {
            *slot.lock() = Some(matches!(result, Err(DataError::NoRuntime(_))));
        });
        assert_eq!(*seen.lock(), Some(true));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        call.cancel();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_map_and_try_map() {
        let call = Call::create(20u32).map(|v| v + 1).try_map(|v| Ok(v * 2));
        assert_eq!(call.execute().await.unwrap(), 42);

        let failing = Call::create(1u32)
            .try_map(|_| Err::<u32, _>(DataError::invalid_argument("bad")));
        assert!(matches!(
            failing.execute().await,
            Err(DataError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_flat_map_chains_calls() {
        let call = Call::create(3usize).flat_map(|n| Call::create(vec![0u8; n]));
        assert_eq!(call.execute().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_handle_error_recovers() {
        let call = Call::new("fails", |_| async {
            Err::<Vec<u8>, _>(DataError::timeout("memory", 5))
        })
        .handle_error(|err| if err.is_transient() { Ok(Vec::new()) } else { Err(err) });
        assert!(call.execute().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_execute() {
        let call = Call::create(1u8);
        call.cancel();
        call.cancel();
        assert!(call.is_canceled());
        assert!(matches!(call.execute().await, Err(DataError::Canceled)));
    }

    #[tokio::test]
    async fn test_cancel_mapped_call_stops_upstream() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let call = Arc::new(
            Call::new("slow", move |_| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(1u32)
                }
            })
            .map(|v| v + 1),
        );

        let running = call.clone();
        let task = tokio::spawn(async move { running.execute().await });
        tokio::task::yield_now().await;
        call.cancel();

        assert!(matches!(task.await.unwrap(), Err(DataError::Canceled)));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_release_on_failure() {
        let released = Arc::new(AtomicUsize::new(0));

        let r = released.clone();
        let ok = Call::create(()).release_on_failure(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        ok.execute().await.unwrap();
        ok.cancel();
        assert_eq!(released.load(Ordering::SeqCst), 0);

        let r = released.clone();
        let failing = Call::new("fails", |_| async {
            Err::<(), _>(DataError::overloaded("memory", "busy"))
        })
        .release_on_failure(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert!(failing.execute().await.unwrap_err().is_overloaded());
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let r = released.clone();
        let canceled = Call::create(()).release_on_failure(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        canceled.cancel();
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    fn slow_release(released: Arc<AtomicUsize>) -> Call<()> {
        Call::new("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .release_on_failure(move || {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_in_flight_cancel_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let call = Arc::new(slow_release(released.clone()));

        let running = call.clone();
        let task = tokio::spawn(async move { running.execute().await });
        tokio::task::yield_now().await;
        call.cancel();

        assert!(matches!(task.await.unwrap(), Err(DataError::Canceled)));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_nested_call_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let inner_released = released.clone();
        let call = Arc::new(
            Call::create(()).flat_map(move |_| slow_release(inner_released.clone())),
        );

        let running = call.clone();
        let task = tokio::spawn(async move { running.execute().await });
        tokio::task::yield_now().await;
        call.cancel();

        assert!(matches!(task.await.unwrap(), Err(DataError::Canceled)));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
