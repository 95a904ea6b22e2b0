//! Blocking executors: where wrapped calls actually run.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

/// Environment variable read by [`ThreadPool::from_env`].
pub const BLOCKING_THREADS_ENV: &str = "TAU_BLOCKING_THREADS";

/// A unit of blocking work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs blocking jobs on some thread other than the caller's.
pub trait BlockingExecutor: Send + Sync {
    /// Hand `job` over for execution. Must not block waiting for a free
    /// thread; excess work is queued.
    fn execute(&self, job: Job) -> io::Result<()>;
}

/// Builder for a [`ThreadPool`].
#[derive(Debug, Default)]
#[must_use]
pub struct ThreadPoolBuilder {
    /// Number of threads. If `None` or zero, uses the logical core count.
    workers: Option<usize>,
    /// Thread name prefix.
    thread_name: Option<String>,
}

impl ThreadPoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Threads are named `{thread_name}-{index}`. Default: `tau-blocking`.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    pub fn build(self) -> io::Result<ThreadPool> {
        let workers = match self.workers {
            Some(n) if n > 0 => n,
            _ => num_cpus::get(),
        };
        let name = self.thread_name.unwrap_or_else(|| "tau-blocking".to_string());
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(receiver))?;
            handles.push(handle);
        }
        tracing::debug!(workers, name = %name, "thread pool started");

        Ok(ThreadPool {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        })
    }
}

/// A fixed set of reusable worker threads fed from one unbounded queue.
pub struct ThreadPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::new()
    }

    pub fn new(workers: usize) -> io::Result<Self> {
        Self::builder().workers(workers).build()
    }

    /// Size the pool from `TAU_BLOCKING_THREADS`, falling back to the
    /// logical core count.
    pub fn from_env() -> io::Result<Self> {
        let mut builder = Self::builder();
        if let Ok(value) = std::env::var(BLOCKING_THREADS_ENV) {
            match value.trim().parse::<usize>() {
                Ok(workers) if workers > 0 => builder = builder.workers(workers),
                _ => tracing::warn!(value = %value, "ignoring invalid {BLOCKING_THREADS_ENV}"),
            }
        }
        builder.build()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Stop accepting jobs, let the workers drain the queue, and join them.
    ///
    /// A worker calling this on its own pool is not joined.
    pub fn shutdown(&self) {
        // Dropping the only sender disconnects the workers once the queue is empty.
        drop(self.sender.lock().unwrap().take());

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("thread pool worker panicked");
            }
        }
        tracing::debug!("thread pool shut down");
    }
}

impl BlockingExecutor for ThreadPool {
    fn execute(&self, job: Job) -> io::Result<()> {
        let sender = self.sender.lock().unwrap();
        let sender = sender
            .as_ref()
            .ok_or_else(|| io::Error::other("thread pool is shut down"))?;
        sender
            .send(job)
            .map_err(|_| io::Error::other("thread pool is shut down"))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        // Bridge jobs catch their own panics; this keeps the worker alive
        // for raw jobs that don't.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("<non-string payload>");
            tracing::error!(panic = message, "job panicked on thread pool worker");
        }
    }
}

/// Runs every job on its own freshly spawned thread.
///
/// Never shares a thread between calls, so a job that blocks on the
/// scheduler cannot starve other jobs of workers.
#[derive(Debug, Default)]
pub struct SeparateThreads {
    spawned: AtomicU64,
}

impl SeparateThreads {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockingExecutor for SeparateThreads {
    fn execute(&self, job: Job) -> io::Result<()> {
        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("tau-separate-{index}"))
            .spawn(job)?;
        Ok(())
    }
}
