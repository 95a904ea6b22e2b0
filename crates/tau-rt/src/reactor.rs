use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

use polling::{Events, Poller};

/// Timer state: BTreeMap for ordered expiry iteration, HashMap for handle→deadline lookup.
struct TimerState {
    /// Timers ordered by (deadline, id) for efficient expiry scanning.
    heap: BTreeMap<(Instant, u64), Waker>,
    /// Reverse lookup: timer id → deadline, for cancel and poll by handle.
    /// `None` marks a deadline past what `Instant` can represent.
    deadlines: HashMap<u64, Option<Instant>>,
    /// Wakers of timers that never fire, held only so shutdown drops them.
    unbounded: HashMap<u64, Waker>,
}

/// Parks the scheduler thread until the next timer deadline or until another
/// thread pushes work and calls [`Reactor::notify`].
pub(crate) struct Reactor {
    poller: Poller,
    timers: Mutex<TimerState>,
    timer_id: AtomicU64,
    events: Mutex<Events>,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Reactor {
            poller: Poller::new()?,
            timers: Mutex::new(TimerState {
                heap: BTreeMap::new(),
                deadlines: HashMap::new(),
                unbounded: HashMap::new(),
            }),
            timer_id: AtomicU64::new(0),
            events: Mutex::new(Events::new()),
        })
    }

    /// Wake the scheduler thread out of `react`. If nobody is waiting the
    /// next `react` returns immediately.
    pub(crate) fn notify(&self) {
        if let Err(err) = self.poller.notify() {
            tracing::warn!(%err, "failed to notify reactor");
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Create a timer that fires after `duration`. Returns an opaque timer handle.
    ///
    /// A duration too large to add to the current instant never fires.
    pub(crate) fn timer_create(&self, duration: Duration) -> u64 {
        let id = self.timer_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now().checked_add(duration);
        let mut state = self.timers.lock().unwrap();
        state.deadlines.insert(id, deadline);
        // Waker is stored on first timer_poll, not here.
        id
    }

    /// Cancel a pending timer. The stored waker (if any) is dropped, not woken.
    pub(crate) fn timer_cancel(&self, id: u64) {
        let mut state = self.timers.lock().unwrap();
        match state.deadlines.remove(&id) {
            Some(Some(deadline)) => {
                state.heap.remove(&(deadline, id));
            }
            Some(None) => {
                state.unbounded.remove(&id);
            }
            None => {}
        }
    }

    /// Poll a timer. Returns Ready if deadline passed, Pending otherwise.
    pub(crate) fn timer_poll(&self, id: u64, waker: Waker) -> Poll<()> {
        let mut state = self.timers.lock().unwrap();
        let deadline = match state.deadlines.get(&id).copied() {
            Some(Some(d)) => d,
            Some(None) => {
                state.unbounded.insert(id, waker);
                return Poll::Pending;
            }
            None => return Poll::Ready(()), // Already fired or cancelled.
        };

        if Instant::now() >= deadline {
            state.deadlines.remove(&id);
            state.heap.remove(&(deadline, id));
            return Poll::Ready(());
        }

        // Not yet expired: store or replace the waker.
        state.heap.insert((deadline, id), waker);
        Poll::Pending
    }

    /// Drop every registered timer waker. Used on runtime shutdown so that
    /// tasks parked on timers are released.
    pub(crate) fn clear_timers(&self) {
        let (heap, unbounded) = {
            let mut state = self.timers.lock().unwrap();
            state.deadlines.clear();
            (
                std::mem::take(&mut state.heap),
                std::mem::take(&mut state.unbounded),
            )
        };
        // Dropped outside the lock: a waker may own the last reference to a
        // task whose destructor cancels another timer.
        drop(heap);
        drop(unbounded);
    }

    // ── React ───────────────────────────────────────────────────────

    /// Fire expired timers, then wait for the next deadline, a notification,
    /// or `timeout`, whichever comes first.
    pub(crate) fn react(&self, timeout: Option<Duration>) -> io::Result<()> {
        let mut wakers = Vec::new();

        // 1. Process expired timers.
        let next_timer = {
            let now = Instant::now();
            let mut state = self.timers.lock().unwrap();
            loop {
                match state.heap.first_key_value().map(|(key, _)| *key) {
                    Some((deadline, id)) if deadline <= now => {
                        if let Some(waker) = state.heap.remove(&(deadline, id)) {
                            wakers.push(waker);
                        }
                        state.deadlines.remove(&id);
                    }
                    Some((deadline, _)) => break Some(deadline.duration_since(now)),
                    None => break None,
                }
            }
        };

        // 2. Expired timers mean there is work; don't park.
        let effective_timeout = if !wakers.is_empty() {
            Some(Duration::ZERO)
        } else {
            match (timeout, next_timer) {
                (None, None) => None,
                (Some(t), None) | (None, Some(t)) => Some(t),
                (Some(a), Some(b)) => Some(a.min(b)),
            }
        };

        // 3. Park. No IO sources are registered, so the only events are
        //    notifications and the timeout itself.
        {
            let mut events = self.events.lock().unwrap();
            events.clear();
            self.poller.wait(&mut events, effective_timeout)?;
        }

        // 4. Wake all; tasks re-enter the executor's ready queue.
        for waker in wakers {
            waker.wake();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::task::Wake;

    struct FlagWaker(AtomicBool);

    impl Wake for FlagWaker {
        fn wake(self: Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn flag_waker() -> (Arc<FlagWaker>, Waker) {
        let flag = Arc::new(FlagWaker(AtomicBool::new(false)));
        (flag.clone(), Waker::from(flag))
    }

    #[test]
    fn timer_create_and_poll_expired() {
        let reactor = Reactor::new().unwrap();
        let id = reactor.timer_create(Duration::ZERO);

        std::thread::sleep(Duration::from_millis(1));

        let (_, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(id, waker), Poll::Ready(()));
    }

    #[test]
    fn timer_cancel_removes_entry() {
        let reactor = Reactor::new().unwrap();
        let id = reactor.timer_create(Duration::from_secs(1));
        let (_, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(id, waker), Poll::Pending);

        reactor.timer_cancel(id);

        // Poll after cancel should return Ready (no entry found).
        let (_, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(id, waker), Poll::Ready(()));
    }

    #[test]
    fn react_fires_expired_timers() {
        let reactor = Reactor::new().unwrap();
        let id = reactor.timer_create(Duration::from_millis(10));
        let (flag, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(id, waker), Poll::Pending);

        std::thread::sleep(Duration::from_millis(15));
        reactor.react(Some(Duration::ZERO)).unwrap();

        assert!(flag.0.load(Ordering::SeqCst), "timer waker should have fired");
    }

    #[test]
    fn react_parks_until_next_deadline() {
        let reactor = Reactor::new().unwrap();
        let id = reactor.timer_create(Duration::from_millis(30));
        let (flag, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(id, waker), Poll::Pending);

        let start = Instant::now();
        while !flag.0.load(Ordering::SeqCst) {
            reactor.react(None).unwrap();
            assert!(start.elapsed() < Duration::from_secs(2), "timer never fired");
        }
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn notify_interrupts_react_from_another_thread() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let remote = reactor.clone();

        let start = Instant::now();
        let notifier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.notify();
        });

        reactor.react(Some(Duration::from_secs(5))).unwrap();
        notifier.join().unwrap();

        assert!(
            start.elapsed() < Duration::from_secs(1),
            "react ignored notification: {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn unrepresentable_deadline_never_fires() {
        let reactor = Reactor::new().unwrap();
        let id = reactor.timer_create(Duration::MAX);
        let (flag, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(id, waker), Poll::Pending);

        reactor.react(Some(Duration::from_millis(5))).unwrap();
        assert!(!flag.0.load(Ordering::SeqCst));
        let (_, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(id, waker), Poll::Pending);

        reactor.timer_cancel(id);
        assert_eq!(Arc::strong_count(&flag), 1);
        let (_, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(id, waker), Poll::Ready(()));
    }

    #[test]
    fn clear_timers_drops_wakers() {
        let reactor = Reactor::new().unwrap();
        let id = reactor.timer_create(Duration::from_secs(10));
        let (flag, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(id, waker), Poll::Pending);
        assert_eq!(Arc::strong_count(&flag), 2);

        let forever = reactor.timer_create(Duration::MAX);
        let (forever_flag, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(forever, waker), Poll::Pending);

        reactor.clear_timers();

        assert_eq!(Arc::strong_count(&flag), 1);
        assert_eq!(Arc::strong_count(&forever_flag), 1);
        assert!(!flag.0.load(Ordering::SeqCst));
    }
}
