use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use futures::FutureExt;
use tau_rt::Handle;

use crate::context::{self, Scoped};
use crate::error::{Error, Panic, Result};
use crate::threaded::Outcome;

/// Run the future produced by `factory` on the scheduler behind `handle` and
/// block the calling thread until it completes.
///
/// The task runs with the caller's ambient context. With a `timeout`, the
/// wait gives up with [`Error::Timeout`] but the task keeps running on the
/// scheduler and its result is discarded.
///
/// Must not be called from the scheduler's own thread: that returns
/// [`Error::SchedulerThread`] without scheduling anything.
pub fn sync_wait<F, Fut>(handle: &Handle, factory: F, timeout: Option<Duration>) -> Result<Fut::Output>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    if handle.is_current() {
        return Err(Error::SchedulerThread);
    }

    // One slot, one writer: the send is the completion signal.
    let (tx, rx) = crossbeam_channel::bounded::<Outcome<Fut::Output>>(1);
    let task = async move {
        let outcome = AssertUnwindSafe(async move { factory().await })
            .catch_unwind()
            .await
            .map_err(Panic::new);
        if tx.send(outcome).is_err() {
            tracing::debug!("sync_wait caller stopped waiting, discarding result");
        }
    };
    handle.spawn(Scoped::new(context::capture(), task)).detach();

    let outcome = match timeout {
        Some(limit) => rx.recv_timeout(limit).map_err(|err| match err {
            RecvTimeoutError::Timeout => Error::Timeout(limit),
            RecvTimeoutError::Disconnected => Error::SchedulerClosed,
        })?,
        None => rx.recv().map_err(|_| Error::SchedulerClosed)?,
    };
    outcome.map_err(Error::Panicked)
}
