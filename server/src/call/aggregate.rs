//! Fan-out / fan-in over several calls
//!
//! Children run concurrently under one token. Their results are folded in
//! enumeration order, and only the first failure (again in enumeration order)
//! reaches the caller. Side effects of children that already succeeded are
//! left in place.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::{Call, CallResult, Runner};

/// Folds child results into one output.
pub trait Aggregator<I, O>: Send + Sync + 'static {
    fn new_output(&self) -> O;

    /// Fold the result of child `index` into `output`.
    fn append(&self, index: usize, input: I, output: &mut O);
}

/// Constructors for aggregate calls
pub struct AggregateCall;

impl AggregateCall {
    /// Combine `calls` into one call whose value is folded by `aggregator`.
    ///
    /// Canceling the returned call cancels every child, including their
    /// release hooks.
    pub fn create<I, O, A>(calls: Vec<Call<I>>, aggregator: A) -> Call<O>
    where
        I: Send + 'static,
        O: Send + 'static,
        A: Aggregator<I, O>,
    {
        let name: Arc<str> = format!("aggregate[{}]", calls.len()).into();
        let mut hooks = Vec::new();
        let mut runs: Vec<Runner<I>> = Vec::with_capacity(calls.len());
        for call in calls {
            hooks.extend(call.cancel_hooks);
            runs.push(call.run);
        }
        let runs = Arc::new(runs);
        let aggregator = Arc::new(aggregator);

        let run: Runner<O> = Arc::new(move |token: CancellationToken| {
            let pending: Vec<_> = runs.iter().map(|run| run(token.child_token())).collect();
            let aggregator = aggregator.clone();
            async move { fold(join_all(pending).await, aggregator.as_ref()) }.boxed()
        });
        Call::reuse(name, run, hooks, CancellationToken::new())
    }

    /// Combine write calls that produce no value.
    pub fn new_void_call(mut calls: Vec<Call<()>>) -> Call<()> {
        match calls.len() {
            0 => Call::create(()),
            1 => calls.remove(0),
            _ => Self::create(calls, VoidAggregator),
        }
    }

    /// Concatenate list results in enumeration order.
    pub fn concat_lists<T: Send + 'static>(mut calls: Vec<Call<Vec<T>>>) -> Call<Vec<T>> {
        match calls.len() {
            0 => Call::empty_list(),
            1 => calls.remove(0),
            _ => Self::create(calls, ConcatLists),
        }
    }
}

fn fold<I, O, A>(results: Vec<CallResult<I>>, aggregator: &A) -> CallResult<O>
where
    A: Aggregator<I, O>,
{
    let mut output = aggregator.new_output();
    let mut first_error = None;
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(input) => {
                if first_error.is_none() {
                    aggregator.append(index, input, &mut output);
                }
            }
            Err(err) if first_error.is_none() => first_error = Some(err),
            Err(err) => {
                tracing::debug!(index, error = %err, "Dropping additional aggregate failure");
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(output),
    }
}

struct VoidAggregator;

impl Aggregator<(), ()> for VoidAggregator {
    fn new_output(&self) {}

    fn append(&self, _index: usize, _input: (), _output: &mut ()) {}
}

struct ConcatLists;

impl<T: Send + 'static> Aggregator<Vec<T>, Vec<T>> for ConcatLists {
    fn new_output(&self) -> Vec<T> {
        Vec::new()
    }

    fn append(&self, _index: usize, input: Vec<T>, output: &mut Vec<T>) {
        output.extend(input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::error::DataError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn tracked(id: usize, log: Arc<parking_lot::Mutex<Vec<usize>>>) -> Call<()> {
        Call::new(format!("write-{id}"), move |_| {
            let log = log.clone();
            async move {
                log.lock().push(id);
                Ok(())
            }
        })
    }

    fn failing(reason: &'static str) -> Call<()> {
        Call::new(reason, move |_| async move { Err(DataError::database("memory", reason)) })
    }

    #[tokio::test]
    async fn test_void_call_runs_every_child_once() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let calls = (0..5).map(|i| tracked(i, log.clone())).collect();
        let call = AggregateCall::new_void_call(calls);

        call.execute().await.unwrap();
        let mut seen = log.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_void_call_trivial_sizes() {
        AggregateCall::new_void_call(Vec::new()).execute().await.unwrap();

        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let single = AggregateCall::new_void_call(vec![tracked(9, log.clone())]);
        assert_eq!(single.name(), "write-9");
        single.execute().await.unwrap();
        assert_eq!(*log.lock(), vec![9]);
    }

    #[tokio::test]
    async fn test_first_error_surfaces_and_siblings_still_run() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let call = AggregateCall::new_void_call(vec![
            tracked(0, log.clone()),
            failing("first"),
            tracked(2, log.clone()),
            failing("second"),
        ]);

        let err = call.execute().await.unwrap_err();
        assert_eq!(err.to_string(), "Database error on memory: first");
        let mut seen = log.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_concat_lists_preserves_enumeration_order() {
        let slow = Call::new("slow", |_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(vec!["a", "b"])
        });
        let fast = Call::create(vec!["c"]);
        let call = AggregateCall::concat_lists(vec![slow, fast]);
        assert_eq!(call.execute().await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_cancel_reaches_children() {
        let released = Arc::new(AtomicUsize::new(0));
        let calls = (0..3)
            .map(|_| {
                let released = released.clone();
                Call::new("pending", |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .release_on_failure(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        let call = Arc::new(AggregateCall::new_void_call(calls));

        let running = call.clone();
        let task = tokio::spawn(async move { running.execute().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        call.cancel();

        assert!(task.await.unwrap().unwrap_err().is_canceled());
        // each child releases via its cancel hook and again when its future drops
        assert!(released.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_enqueue_aggregate() {
        let call = AggregateCall::concat_lists(vec![Call::create(vec![1]), Call::create(vec![2])]);
        let (tx, rx) = tokio::sync::oneshot::channel();
        call.enqueue(move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap().unwrap(), vec![1, 2]);
    }
}
