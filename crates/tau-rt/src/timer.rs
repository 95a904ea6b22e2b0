//! Async timer.
//!
//! Creates a one-shot timer in the runtime's reactor and provides a `Future`
//! implementation that resolves when the deadline expires.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use crate::executor::{Handle, Shared};

/// Sleep for the given duration on the runtime driving the current thread.
///
/// The runtime is resolved on first poll, so the returned future may be
/// created anywhere but must be polled by a runtime.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        shared: None,
        duration,
        timer: None,
        fired: false,
    }
}

/// A one-shot timer future.
///
/// Created via [`sleep`] or [`Handle::sleep`]. Cancels the timer on drop if
/// it hasn't fired yet.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    shared: Option<Weak<Shared>>,
    duration: Duration,
    timer: Option<u64>,
    fired: bool,
}

impl Sleep {
    pub(crate) fn with_shared(shared: Weak<Shared>, duration: Duration) -> Self {
        Sleep {
            shared: Some(shared),
            duration,
            timer: None,
            fired: false,
        }
    }

    fn runtime(&mut self) -> Option<Arc<Shared>> {
        let weak = self.shared.get_or_insert_with(|| {
            let handle = Handle::current()
                .expect("`sleep` polled outside of a running tau runtime");
            Arc::downgrade(&handle.shared)
        });
        weak.upgrade()
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.fired {
            return Poll::Ready(());
        }
        let Some(shared) = self.runtime() else {
            // The runtime is gone; nothing will ever fire this timer.
            self.fired = true;
            return Poll::Ready(());
        };

        let duration = self.duration;
        let id = *self
            .timer
            .get_or_insert_with(|| shared.reactor.timer_create(duration));
        match shared.reactor.timer_poll(id, cx.waker().clone()) {
            Poll::Ready(()) => {
                self.fired = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if self.fired {
            return;
        }
        if let (Some(id), Some(shared)) = (self.timer, self.shared.as_ref().and_then(Weak::upgrade)) {
            shared.reactor.timer_cancel(id);
        }
    }
}
