use std::sync::{Arc, Mutex};

use tracing::dispatcher::DefaultGuard;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::executor::{ThreadPool, BLOCKING_THREADS_ENV};
use crate::scheduler::Scheduler;
use crate::threaded::{threaded, threaded_separate, Threaded};

/// Log to the test output for the lifetime of the guard. Filter with `RUST_LOG`.
pub(crate) fn trace() -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .with_test_writer()
        .set_default()
}

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Run `f` with `TAU_BLOCKING_THREADS` set to `value` (or unset), one test at
/// a time.
pub(crate) fn with_blocking_threads<R>(value: Option<&str>, f: impl FnOnce() -> R) -> R {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    match value {
        Some(value) => std::env::set_var(BLOCKING_THREADS_ENV, value),
        None => std::env::remove_var(BLOCKING_THREADS_ENV),
    }
    let result = f();
    std::env::remove_var(BLOCKING_THREADS_ENV);
    result
}

/// A fresh runtime and a scheduler over a pool of `workers` threads.
pub(crate) fn scheduler(workers: usize) -> (tau_rt::Runtime, Scheduler) {
    let rt = tau_rt::Runtime::new().unwrap();
    let pool = ThreadPool::new(workers).unwrap();
    let scheduler = Scheduler::new(rt.handle().clone(), Arc::new(pool));
    (rt, scheduler)
}

/// Wrap `f` with either adapter, for tests that must hold for both.
pub(crate) fn wrap<F>(separate: bool, scheduler: &Scheduler, f: F) -> Threaded<F> {
    if separate {
        threaded_separate(f)
    } else {
        threaded(scheduler, f)
    }
}
