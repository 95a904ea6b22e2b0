//! Ambient per-call context.
//!
//! Every thread has an ambient [`Context`]: an immutable map of typed
//! [`ContextKey`] bindings. Setting a key replaces the thread's map with an
//! updated copy, so a previously [`capture`]d snapshot never changes.
//!
//! Snapshots travel with blocking calls and scheduled tasks as plain values:
//! [`Context::install`] makes one ambient on the current thread and the
//! returned [`RestoreToken`] puts the previous one back.
//!
//! On the scheduler thread, futures wrapped in [`Scoped`] (the root of
//! [`block_on`](crate::block_on) and tasks from
//! [`Scheduler::spawn`](crate::Scheduler::spawn)) carry their own context.
//! Tasks spawned directly on a [`Handle`](crate::Handle) are unscoped and
//! share the thread's ambient context.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::Poll;

use pin_project::pin_project;

static NEXT_KEY: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static AMBIENT: RefCell<Context> = RefCell::new(Context::default());
}

/// A typed context variable.
///
/// Keys are usually statics:
///
/// ```ignore
/// static REQUEST_ID: ContextKey<u64> = ContextKey::new("request_id");
///
/// REQUEST_ID.set(7);
/// assert_eq!(REQUEST_ID.get(), Some(7));
/// ```
pub struct ContextKey<T> {
    name: &'static str,
    id: OnceLock<u64>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    pub const fn new(name: &'static str) -> Self {
        ContextKey {
            name,
            id: OnceLock::new(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn id(&self) -> u64 {
        *self
            .id
            .get_or_init(|| NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl<T: Clone + Send + Sync + 'static> ContextKey<T> {
    /// The value bound in the current thread's ambient context.
    pub fn get(&self) -> Option<T> {
        AMBIENT.with(|ambient| ambient.borrow().get(self))
    }

    /// Bind `value` in the current thread's ambient context.
    pub fn set(&self, value: T) {
        AMBIENT.with(|ambient| {
            let mut ambient = ambient.borrow_mut();
            *ambient = ambient.with(self, value);
        });
    }
}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextKey").field(&self.name).finish()
    }
}

/// An immutable snapshot of context bindings.
#[derive(Clone, Default)]
pub struct Context {
    bindings: Arc<HashMap<u64, Arc<dyn Any + Send + Sync>>>,
}

/// Snapshot the ambient context of the current thread.
pub fn capture() -> Context {
    AMBIENT.with(|ambient| ambient.borrow().clone())
}

impl Context {
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &ContextKey<T>) -> Option<T> {
        self.bindings
            .get(&key.id())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// A copy of this context with `key` bound to `value`.
    pub fn with<T: Clone + Send + Sync + 'static>(&self, key: &ContextKey<T>, value: T) -> Context {
        let mut bindings = HashMap::clone(&self.bindings);
        bindings.insert(key.id(), Arc::new(value));
        Context {
            bindings: Arc::new(bindings),
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Make this context ambient on the current thread.
    pub fn install(self) -> RestoreToken {
        let prev = AMBIENT.with(|ambient| ambient.replace(self));
        RestoreToken {
            prev: Some(prev),
            _not_send: PhantomData,
        }
    }

    /// Run `f` with this context ambient, restoring the previous one after,
    /// including when `f` panics.
    pub fn scope<R>(self, f: impl FnOnce() -> R) -> R {
        let _token = self.install();
        f()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

/// Reverts the ambient context to what it was before [`Context::install`].
///
/// Must be restored on the thread that installed it, so it is `!Send`.
/// Dropping the token restores too.
#[must_use = "dropping the token restores the previous context immediately"]
pub struct RestoreToken {
    prev: Option<Context>,
    _not_send: PhantomData<*const ()>,
}

impl RestoreToken {
    /// Restore the previous context and return the one that was ambient
    /// until now, including bindings set while it was installed.
    pub fn restore(mut self) -> Context {
        let prev = self.prev.take().unwrap_or_default();
        AMBIENT.with(|ambient| ambient.replace(prev))
    }
}

impl Drop for RestoreToken {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            let _ = AMBIENT.try_with(|ambient| ambient.replace(prev));
        }
    }
}

/// A future that runs with its own ambient context.
///
/// The context is installed around every poll, and bindings the future sets
/// are kept for its next poll without leaking into whatever else runs on the
/// thread.
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Scoped<F> {
    context: Context,
    #[pin]
    future: F,
}

impl<F> Scoped<F> {
    pub fn new(context: Context, future: F) -> Self {
        Scoped { context, future }
    }
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<F::Output> {
        let this = self.project();
        let token = this.context.clone().install();
        let poll = this.future.poll(cx);
        *this.context = token.restore();
        poll
    }
}
