//! tau-rt: single-threaded cooperative async runtime.
//!
//! A [`Runtime`] owns a ready queue of tasks and a timer reactor. Whichever
//! thread calls [`Runtime::block_on`] becomes the scheduler thread and polls
//! every task one at a time. Any thread may submit work through a [`Handle`];
//! the submission wakes a parked scheduler.
//!
//! ```ignore
//! use std::time::Duration;
//!
//! let rt = tau_rt::Runtime::new()?;
//! let handle = rt.handle().clone();
//! let answer = rt.block_on(async move {
//!     let task = handle.spawn(async { 42 });
//!     tau_rt::sleep(Duration::from_millis(10)).await;
//!     task.await
//! });
//! assert_eq!(answer, 42);
//! ```

mod executor;
mod reactor;
mod timer;

pub use async_task::Task;
pub use executor::{Handle, Runtime};
pub use timer::{sleep, Sleep};
