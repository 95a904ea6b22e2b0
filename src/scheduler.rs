use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tau_rt::{Handle, Runtime, Task};

use crate::context::{self, Scoped};
use crate::error::Result;
use crate::executor::{BlockingExecutor, ThreadPool};
use crate::iterable::{dispatch_iter, ThreadedStream};
use crate::threaded::{self, dispatch, PendingCall, Threaded};

/// A cooperative scheduler paired with the executor its blocking calls use.
///
/// Cheap to clone and safe to share with worker threads, which use it to
/// reach back into the scheduler through [`Scheduler::sync_wait`].
#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
    executor: Arc<dyn BlockingExecutor>,
}

impl Scheduler {
    pub fn new(handle: Handle, executor: Arc<dyn BlockingExecutor>) -> Self {
        Scheduler { handle, executor }
    }

    /// Pair `runtime` with a pool sized from `TAU_BLOCKING_THREADS`.
    pub fn from_env(runtime: &Runtime) -> io::Result<Self> {
        let pool = ThreadPool::from_env()?;
        tracing::debug!(workers = pool.worker_count(), "blocking pool configured");
        Ok(Self::new(runtime.handle().clone(), Arc::new(pool)))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn executor(&self) -> &Arc<dyn BlockingExecutor> {
        &self.executor
    }

    /// Spawn a task that runs with the caller's ambient context.
    ///
    /// Bindings the task sets stay with the task. Tasks spawned directly on
    /// the [`Handle`] are not scoped and share the scheduler thread's
    /// ambient context.
    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(Scoped::new(context::capture(), future))
    }

    /// Run a one-off blocking closure on the shared executor.
    pub fn run_in_executor<F, T>(&self, f: F) -> PendingCall<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        dispatch(&*self.executor, f)
    }

    /// See [`threaded::threaded`].
    pub fn threaded<F>(&self, func: F) -> Threaded<F> {
        threaded::threaded(self, func)
    }

    /// See [`threaded::threaded_separate`].
    pub fn threaded_separate<F>(&self, func: F) -> Threaded<F> {
        threaded::threaded_separate(func)
    }

    /// Run `f` on the shared executor and stream the items of the iterator
    /// it returns, keeping at most `max_size` of them buffered.
    ///
    /// A `max_size` of zero behaves like one.
    pub fn threaded_iterable<F, I>(&self, f: F, max_size: usize) -> ThreadedStream<I::Item>
    where
        F: FnOnce() -> I + Send + 'static,
        I: IntoIterator,
        I::Item: Send + 'static,
    {
        dispatch_iter(&*self.executor, f, max_size)
    }

    /// See [`crate::sync_wait`].
    pub fn sync_wait<F, Fut>(&self, factory: F, timeout: Option<Duration>) -> Result<Fut::Output>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        crate::sync_wait::sync_wait(&self.handle, factory, timeout)
    }
}

/// Drive `runtime` until `future` completes, with the future scoped to a
/// snapshot of the calling thread's context.
///
/// Bindings set by the future are neither visible to other tasks on the
/// scheduler thread nor left behind on the calling thread.
pub fn block_on<F: Future>(runtime: &Runtime, future: F) -> F::Output {
    runtime.block_on(Scoped::new(context::capture(), future))
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
