use std::any::Any;
use std::fmt;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The blocking call or scheduled task panicked. The payload is kept
    /// intact so it can be re-raised with [`Panic::resume`].
    #[error("{0}")]
    Panicked(Panic),

    #[error("scheduled task did not complete within {0:?}")]
    Timeout(Duration),

    /// `sync_wait` was called on the scheduler's own thread, which would
    /// block the only thread able to run the task.
    #[error("sync_wait called from the scheduler thread")]
    SchedulerThread,

    /// The executor refused the job: a thread could not be started or the
    /// pool was shut down.
    #[error("executor rejected the call")]
    Rejected(#[source] io::Error),

    /// The executor dropped the job without running it.
    #[error("worker dropped the call before running it")]
    WorkerLost,

    #[error("scheduler shut down before the task completed")]
    SchedulerClosed,
}

impl Error {
    /// Re-raise the original panic if this error carries one, otherwise
    /// return the error unchanged.
    pub fn resume_panic(self) -> Self {
        match self {
            Error::Panicked(panic) => panic.resume(),
            other => other,
        }
    }
}

/// A panic payload captured on one thread, to be observed on another.
///
/// The payload is only reachable by value, which keeps `Panic` (and so
/// [`Error`]) `Sync`.
pub struct Panic {
    message: Option<String>,
    payload: Mutex<Box<dyn Any + Send + 'static>>,
}

impl Panic {
    pub(crate) fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned());
        Panic {
            message,
            payload: Mutex::new(payload),
        }
    }

    /// The panic message, if the payload was a string.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn into_inner(self) -> Box<dyn Any + Send + 'static> {
        // Never locked, so never poisoned.
        self.payload
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Continue unwinding with the original payload on the current thread.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(self.into_inner())
    }
}

impl fmt::Debug for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Panic")
            .field(&self.message().unwrap_or("<non-string payload>"))
            .finish()
    }
}

impl fmt::Display for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => write!(f, "panicked: {message}"),
            None => f.write_str("panicked"),
        }
    }
}
