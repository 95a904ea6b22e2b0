//! Streaming the items of a blocking iterator into cooperative code.

use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};

use crate::context;
use crate::error::{Error, Panic, Result};
use crate::executor::BlockingExecutor;
use crate::threaded::Outcome;

/// Items produced by a blocking iterator on a worker thread.
///
/// Ends when the iterator is exhausted. A panic while producing yields one
/// final [`Error::Panicked`]. Dropping the stream makes the worker stop
/// before producing the next item.
#[must_use = "streams do nothing unless polled"]
pub struct ThreadedStream<T> {
    state: State<T>,
}

enum State<T> {
    Receiving(mpsc::Receiver<Outcome<T>>),
    Rejected(Option<Error>),
}

impl<T> Stream for ThreadedStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<T>>> {
        match &mut self.state {
            State::Receiving(rx) => rx
                .poll_next_unpin(cx)
                .map(|item| item.map(|outcome| outcome.map_err(Error::Panicked))),
            State::Rejected(error) => Poll::Ready(error.take().map(Err)),
        }
    }
}

/// Run `f` on `executor` and forward the items of the iterator it returns,
/// buffering at most `max_size` of them.
pub(crate) fn dispatch_iter<F, I>(
    executor: &dyn BlockingExecutor,
    f: F,
    max_size: usize,
) -> ThreadedStream<I::Item>
where
    F: FnOnce() -> I + Send + 'static,
    I: IntoIterator,
    I::Item: Send + 'static,
{
    let snapshot = context::capture();
    // The channel holds its buffer plus one slot per sender.
    let (mut tx, rx) = mpsc::channel(max_size.saturating_sub(1));

    let job = Box::new(move || {
        snapshot.scope(|| {
            let produced = panic::catch_unwind(AssertUnwindSafe(|| {
                for item in f() {
                    // Blocks this worker while the buffer is full.
                    if futures::executor::block_on(tx.send(Ok(item))).is_err() {
                        tracing::debug!("threaded stream dropped, stopping iteration");
                        return;
                    }
                }
            }));
            if let Err(payload) = produced {
                let _ = futures::executor::block_on(tx.send(Err(Panic::new(payload))));
            }
        })
    });

    match executor.execute(job) {
        Ok(()) => ThreadedStream {
            state: State::Receiving(rx),
        },
        Err(err) => {
            tracing::warn!(%err, "executor rejected threaded iterator");
            ThreadedStream {
                state: State::Rejected(Some(Error::Rejected(err))),
            }
        }
    }
}
