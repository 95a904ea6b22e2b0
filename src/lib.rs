//! tau-bridge: moving work between the tau cooperative scheduler and
//! blocking worker threads.
//!
//! Cooperative code offloads blocking calls with [`threaded`] (shared pool)
//! or [`threaded_separate`] (one thread per call) and awaits the returned
//! [`PendingCall`]. Code running on a worker thread reaches back into the
//! scheduler with [`sync_wait`]. Ambient [`Context`] bindings follow the work
//! in both directions.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tau_bridge::{sleep, Runtime, Scheduler, ThreadPool};
//!
//! let rt = Runtime::new()?;
//! let scheduler = Scheduler::new(rt.handle().clone(), Arc::new(ThreadPool::new(4)?));
//!
//! let remote = scheduler.clone();
//! let read_config = scheduler.threaded_separate(move |path: String| {
//!     let contents = std::fs::read_to_string(&path)?;
//!     // Back onto the scheduler, blocking this worker until it is done.
//!     remote.sync_wait(|| async { sleep(Duration::from_millis(10)).await }, None)
//!         .map_err(std::io::Error::other)?;
//!     Ok::<_, std::io::Error>(contents)
//! });
//!
//! let contents = tau_bridge::block_on(&rt, read_config.call("app.toml".into()))??;
//! ```

mod context;
mod error;
mod executor;
mod iterable;
mod scheduler;
mod sync_wait;
mod threaded;

#[cfg(test)]
mod test_util;

pub use context::{capture, Context, ContextKey, RestoreToken, Scoped};
pub use error::{Error, Panic, Result};
pub use executor::{
    BlockingExecutor, Job, SeparateThreads, ThreadPool, ThreadPoolBuilder, BLOCKING_THREADS_ENV,
};
pub use iterable::ThreadedStream;
pub use scheduler::{block_on, Scheduler};
pub use sync_wait::sync_wait;
pub use tau_rt::{sleep, Handle, Runtime, Sleep, Task};
pub use threaded::{threaded, threaded_separate, PendingCall, Threaded};
