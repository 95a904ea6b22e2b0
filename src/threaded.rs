//! Running blocking callables on worker threads from cooperative code.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::FutureExt;

use crate::context;
use crate::error::{Error, Panic, Result};
use crate::executor::{BlockingExecutor, SeparateThreads};
use crate::scheduler::Scheduler;

/// What a worker hands back: the call's return value, or its panic.
pub(crate) type Outcome<T> = std::result::Result<T, Panic>;

/// The eventual result of a blocking call running on a worker thread.
///
/// Resolves to the callable's return value, or [`Error::Panicked`] if it
/// panicked. Dropping the handle does not stop the worker; the call runs to
/// completion and its result is discarded.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct PendingCall<T> {
    state: State<T>,
}

enum State<T> {
    Waiting(oneshot::Receiver<Outcome<T>>),
    Rejected(Option<Error>),
}

impl<T> Future for PendingCall<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        match &mut self.state {
            State::Waiting(rx) => rx.poll_unpin(cx).map(|received| match received {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(panic)) => Err(Error::Panicked(panic)),
                Err(oneshot::Canceled) => Err(Error::WorkerLost),
            }),
            State::Rejected(error) => Poll::Ready(Err(error.take().unwrap_or(Error::WorkerLost))),
        }
    }
}

/// Submit `f` to `executor` with the caller's ambient context.
pub(crate) fn dispatch<F, T>(executor: &dyn BlockingExecutor, f: F) -> PendingCall<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let snapshot = context::capture();
    let (tx, rx) = oneshot::channel();

    let job = Box::new(move || {
        let outcome = snapshot
            .scope(|| panic::catch_unwind(AssertUnwindSafe(f)))
            .map_err(Panic::new);
        if tx.send(outcome).is_err() {
            tracing::debug!("pending call dropped before completion, discarding result");
        }
    });

    match executor.execute(job) {
        Ok(()) => {
            tracing::trace!("blocking call submitted");
            PendingCall {
                state: State::Waiting(rx),
            }
        }
        Err(err) => {
            tracing::warn!(%err, "executor rejected blocking call");
            PendingCall {
                state: State::Rejected(Some(Error::Rejected(err))),
            }
        }
    }
}

/// A blocking callable wrapped for use from cooperative code.
///
/// Each [`call`](Threaded::call) runs the callable once on the wrapper's
/// executor. Callables take a single argument; use a tuple for several and
/// `()` for none.
pub struct Threaded<F> {
    func: Arc<F>,
    executor: Arc<dyn BlockingExecutor>,
}

impl<F> Threaded<F> {
    pub fn new(func: F, executor: Arc<dyn BlockingExecutor>) -> Self {
        Threaded {
            func: Arc::new(func),
            executor,
        }
    }

    pub fn call<A, T>(&self, args: A) -> PendingCall<T>
    where
        F: Fn(A) -> T + Send + Sync + 'static,
        A: Send + 'static,
        T: Send + 'static,
    {
        let func = Arc::clone(&self.func);
        dispatch(&*self.executor, move || (*func)(args))
    }
}

impl<F> Clone for Threaded<F> {
    fn clone(&self) -> Self {
        Threaded {
            func: Arc::clone(&self.func),
            executor: Arc::clone(&self.executor),
        }
    }
}

/// Wrap `func` to run on the scheduler's shared executor.
pub fn threaded<F>(scheduler: &Scheduler, func: F) -> Threaded<F> {
    Threaded::new(func, Arc::clone(scheduler.executor()))
}

/// Wrap `func` to run on a dedicated thread per call.
///
/// Use this when the callable re-enters the scheduler through
/// [`sync_wait`](crate::sync_wait): on the shared pool, every worker could end
/// up blocked on the scheduler while the scheduler waits for a free worker.
pub fn threaded_separate<F>(func: F) -> Threaded<F> {
    Threaded::new(func, Arc::new(SeparateThreads::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextKey;
    use crate::executor::ThreadPool;
    use crate::test_util::{scheduler, trace, wrap};
    use futures::future::join_all;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn concurrent_calls_overlap() {
        let _trace = trace();
        let (rt, scheduler) = scheduler(8);

        for separate in [false, true] {
            let sleep = wrap(separate, &scheduler, thread::sleep);
            let start = Instant::now();
            let results = rt.block_on(join_all(
                (0..5).map(|_| sleep.call(Duration::from_millis(200))),
            ));
            let elapsed = start.elapsed();

            assert!(results.iter().all(Result::is_ok));
            assert!(elapsed >= Duration::from_millis(200));
            assert!(
                elapsed < Duration::from_millis(500),
                "separate={separate}: calls were serialized: {elapsed:?}"
            );
        }
    }

    #[test]
    fn exhausted_pool_queues_calls() {
        let (rt, scheduler) = scheduler(1);
        let sleep = threaded(&scheduler, thread::sleep);

        let start = Instant::now();
        let results = rt.block_on(join_all(
            (0..3).map(|_| sleep.call(Duration::from_millis(50))),
        ));

        assert!(results.iter().all(Result::is_ok));
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn every_panic_surfaces_individually() {
        let (rt, scheduler) = scheduler(8);

        for separate in [false, true] {
            let worker = wrap(separate, &scheduler, |n: usize| -> usize {
                panic!("worker {n} failed");
            });
            let results = rt.block_on(join_all((0..90).map(|n| worker.call(n))));

            assert_eq!(results.len(), 90);
            for (n, result) in results.into_iter().enumerate() {
                match result {
                    Err(Error::Panicked(panic)) => {
                        assert_eq!(panic.message(), Some(format!("worker {n} failed").as_str()))
                    }
                    other => panic!("expected a panic, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn returned_errors_pass_through_unchanged() {
        let (rt, scheduler) = scheduler(2);
        let open = threaded(&scheduler, |path: &'static str| -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::NotFound, path))
        });

        let err = rt.block_on(open.call("missing.txt")).unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(err.to_string(), "missing.txt");
    }

    #[test]
    fn realized_sequence_is_returned_intact() {
        let (rt, scheduler) = scheduler(2);
        let arange = threaded(&scheduler, |count: u32| (0..count).collect::<Vec<_>>());

        let values = rt.block_on(arange.call(10)).unwrap();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    static SQUARE: ContextKey<usize> = ContextKey::new("square");

    #[test]
    fn each_call_sees_its_own_context() {
        // Two workers for eight calls, so threads are reused.
        let (rt, scheduler) = scheduler(2);

        for separate in [false, true] {
            let check = wrap(separate, &scheduler, |i: usize| SQUARE.get() == Some(i * i));
            let results = rt.block_on(async {
                let mut calls = Vec::new();
                for i in 0..8 {
                    SQUARE.set(i * i);
                    calls.push(check.call(i));
                }
                join_all(calls).await
            });

            for (i, result) in results.into_iter().enumerate() {
                assert!(result.unwrap(), "separate={separate}: call {i} saw a foreign value");
            }
        }
    }

    #[test]
    fn bindings_do_not_leak_between_calls_on_one_worker() {
        let (rt, scheduler) = scheduler(1);
        let set_inside = threaded(&scheduler, |()| SQUARE.set(81));
        let read = threaded(&scheduler, |()| SQUARE.get());

        let seen = rt.block_on(async {
            set_inside.call(()).await.unwrap();
            read.call(()).await.unwrap()
        });

        assert_eq!(seen, None);
        assert_eq!(SQUARE.get(), None);
    }

    #[test]
    fn dropped_call_still_runs_to_completion() {
        let (rt, scheduler) = scheduler(1);
        let finished = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let flag = finished.clone();
        let call = scheduler.run_in_executor(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
            tx.send(()).unwrap();
            "discarded"
        });
        drop(call);

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(finished.load(Ordering::SeqCst));

        // The worker is free again.
        assert_eq!(rt.block_on(scheduler.run_in_executor(|| 5)).unwrap(), 5);
    }

    #[test]
    fn rejected_call_reports_executor_error() {
        let rt = tau_rt::Runtime::new().unwrap();
        let pool = Arc::new(ThreadPool::new(1).unwrap());
        let scheduler = Scheduler::new(rt.handle().clone(), pool.clone());
        pool.shutdown();

        let result = rt.block_on(scheduler.run_in_executor(|| 1));
        assert!(matches!(result, Err(Error::Rejected(_))), "{result:?}");
    }

    #[test]
    fn separate_calls_run_off_the_pool() {
        let (rt, _scheduler) = scheduler(1);
        let name = threaded_separate(|()| thread::current().name().map(str::to_owned));

        let name = rt.block_on(name.call(())).unwrap().unwrap();
        assert!(name.starts_with("tau-separate-"), "{name}");
    }
}
