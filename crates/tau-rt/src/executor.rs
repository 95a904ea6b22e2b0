use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use async_task::{Runnable, Task};
use concurrent_queue::ConcurrentQueue;

use crate::reactor::Reactor;
use crate::timer::Sleep;

/// Ready tasks polled per scheduling round before the root future and the
/// reactor get a turn.
const TICK_BUDGET: usize = 64;

thread_local! {
    /// The scheduler being driven on this thread, if any.
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

pub(crate) struct Shared {
    /// Ready queue: tasks whose wakers have fired.
    queue: ConcurrentQueue<Runnable>,
    pub(crate) reactor: Reactor,
}

impl Shared {
    /// Push a runnable and wake the scheduler thread. Safe to call from
    /// wakers on any thread.
    fn schedule(&self, runnable: Runnable) {
        match self.queue.push(runnable) {
            Ok(()) => self.reactor.notify(),
            Err(err) => {
                tracing::trace!("runtime shut down, cancelling task");
                drop(err.into_inner());
            }
        }
    }
}

/// A single-threaded cooperative task executor.
///
/// Tasks only make progress while some thread drives the runtime through
/// [`Runtime::block_on`] or [`Runtime::try_tick`]; that thread is the
/// scheduler thread. Other threads interact with it through a [`Handle`].
pub struct Runtime {
    handle: Handle,
}

impl Runtime {
    pub fn new() -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: ConcurrentQueue::unbounded(),
            reactor: Reactor::new()?,
        });
        Ok(Runtime {
            handle: Handle { shared },
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a future onto the runtime. See [`Handle::spawn`].
    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Pop one ready task and run it. Returns true if a task was polled.
    pub fn try_tick(&self) -> bool {
        let _enter = Enter::new(&self.handle);
        self.tick()
    }

    /// Drive the executor and reactor on the calling thread until `future`
    /// completes.
    ///
    /// # Panics
    ///
    /// Panics if this thread is already driving a runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let enter = Enter::new(&self.handle);
        assert!(
            enter.prev.is_none(),
            "cannot block_on while a scheduler is already running on this thread"
        );

        let root = Arc::new(RootWaker {
            woken: AtomicBool::new(true),
            shared: Arc::downgrade(&self.handle.shared),
        });
        let waker = Waker::from(root.clone());
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);

        loop {
            if root.woken.swap(false, Ordering::AcqRel) {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return output;
                }
            }

            // Drive executor: poll ready tasks, yielding back to the root
            // future as soon as it is woken.
            let mut did_work = false;
            for _ in 0..TICK_BUDGET {
                if !self.tick() {
                    break;
                }
                did_work = true;
                if root.woken.load(Ordering::Acquire) {
                    break;
                }
            }
            if root.woken.load(Ordering::Acquire) {
                continue;
            }

            // Drive reactor: fire timers, then park until the next deadline
            // or a cross-thread wake-up. Non-blocking if we just did work.
            let timeout = if did_work { Some(Duration::ZERO) } else { None };
            if let Err(err) = self.handle.shared.reactor.react(timeout) {
                tracing::warn!(%err, "reactor failed to wait for events");
            }
        }
    }

    fn tick(&self) -> bool {
        match self.handle.shared.queue.pop() {
            Ok(runnable) => {
                runnable.run();
                true
            }
            Err(_) => false,
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let shared = &self.handle.shared;
        shared.queue.close();
        // Dropping a runnable cancels its task.
        while let Ok(runnable) = shared.queue.pop() {
            drop(runnable);
        }
        shared.reactor.clear_timers();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("ready", &self.handle.shared.queue.len())
            .finish()
    }
}

/// A cloneable, thread-safe reference to a [`Runtime`].
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<Shared>,
}

impl Handle {
    /// Returns the handle of the runtime being driven on this thread.
    pub fn current() -> Option<Handle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Returns true if the calling thread is currently driving this runtime.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|handle| Arc::ptr_eq(&handle.shared, &self.shared))
        })
    }

    /// Spawn a future onto the runtime.
    ///
    /// May be called from any thread; the future is always polled on the
    /// scheduler thread. If the future panics, the panic is re-raised where
    /// the returned [`Task`] is awaited.
    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        // Weak, so runnables parked in the queue don't keep the runtime alive.
        let shared = Arc::downgrade(&self.shared);
        let schedule = move |runnable: Runnable| match shared.upgrade() {
            Some(shared) => shared.schedule(runnable),
            None => drop(runnable),
        };
        let (runnable, task) = async_task::Builder::new()
            .propagate_panic(true)
            .spawn(move |_| future, schedule);
        runnable.schedule();
        task
    }

    /// A future that completes after `duration` on this runtime's timers.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::with_shared(Arc::downgrade(&self.shared), duration)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("runtime", &Arc::as_ptr(&self.shared))
            .finish()
    }
}

/// Marks the current thread as driving a runtime until dropped.
struct Enter {
    prev: Option<Handle>,
}

impl Enter {
    fn new(handle: &Handle) -> Self {
        let prev = CURRENT.with(|current| current.replace(Some(handle.clone())));
        Enter { prev }
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        let prev = self.prev.take();
        let _ = CURRENT.try_with(|current| current.replace(prev));
    }
}

/// Waker for the future passed to `block_on`, which is polled in place
/// rather than through the ready queue.
struct RootWaker {
    woken: AtomicBool,
    shared: Weak<Shared>,
}

impl Wake for RootWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
        if let Some(shared) = self.shared.upgrade() {
            shared.reactor.notify();
        }
    }
}
