//! The virtual uptime clock shared by every loop of a registry.
//!
//! Time only moves when a test moves it. Every successful advance runs all
//! registered [`ClockListener`]s on the advancing thread before returning, so
//! a loop woken by an advance always observes the new value.

use crate::error::{Error, Result};
use crate::tracing_compat::{debug, info};
use crate::types::Time;
use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A source of the current virtual time.
pub trait TimeSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// Observer of clock advances.
///
/// Called synchronously on the advancing thread with no clock lock held, so
/// implementations may enqueue work, advance nothing, and add or remove
/// listeners freely.
pub trait ClockListener: Send + Sync {
    /// The clock has just moved forward to `now`.
    fn on_advance(&self, now: Time);
}

impl<F> ClockListener for F
where
    F: Fn(Time) + Send + Sync,
{
    fn on_advance(&self, now: Time) {
        self(now);
    }
}

/// Registration returned by [`VirtualClock::add_listener`].
///
/// Deliberately not `Clone`: a registration is removed at most once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

/// Manually advanced monotonic clock.
///
/// ```
/// use looperlab::time::{TimeSource, VirtualClock};
/// use looperlab::types::Time;
/// use std::time::Duration;
///
/// let clock = VirtualClock::starting_at(Time::from_millis(100));
/// clock.advance_by(Duration::from_millis(50));
/// assert_eq!(clock.now(), Time::from_millis(150));
/// assert!(clock.advance_to(Time::from_millis(10)).is_err());
/// ```
pub struct VirtualClock {
    now: AtomicU64,
    /// Serializes check-and-store of `now`.
    advance_lock: Mutex<()>,
    listeners: Mutex<Slab<Arc<dyn ClockListener>>>,
}

impl VirtualClock {
    /// Creates a clock at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Time::ZERO)
    }

    /// Creates a clock at the given time.
    #[must_use]
    pub fn starting_at(time: Time) -> Self {
        info!(start = %time, "virtual clock initialized");
        Self {
            now: AtomicU64::new(time.as_nanos()),
            advance_lock: Mutex::new(()),
            listeners: Mutex::new(Slab::new()),
        }
    }

    /// Current virtual time. Never blocks.
    #[must_use]
    pub fn now(&self) -> Time {
        Time::from_nanos(self.now.load(Ordering::Acquire))
    }

    /// Moves the clock forward to `target` and notifies listeners.
    ///
    /// Advancing to the current time is allowed and still notifies.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `target` is before [`now`](Self::now);
    /// the clock is left unchanged.
    pub fn advance_to(&self, target: Time) -> Result<()> {
        {
            let _guard = self.advance_lock.lock();
            let current = self.now();
            if target < current {
                return Err(Error::invalid_argument(format!(
                    "cannot move clock backwards from {current} to {target}"
                )));
            }
            self.now.store(target.as_nanos(), Ordering::Release);
        }
        self.notify(target);
        Ok(())
    }

    /// Moves the clock forward by `delta`, notifies listeners, and returns the new time.
    pub fn advance_by(&self, delta: Duration) -> Time {
        let target = {
            let _guard = self.advance_lock.lock();
            let target = self.now() + delta;
            self.now.store(target.as_nanos(), Ordering::Release);
            target
        };
        self.notify(target);
        target
    }

    /// Sets the clock to `time`, backwards if need be, without notifying.
    ///
    /// Only for test boundaries.
    pub fn reset(&self, time: Time) {
        let _guard = self.advance_lock.lock();
        self.now.store(time.as_nanos(), Ordering::Release);
        debug!(now = %time, "virtual clock reset");
    }

    /// Registers a listener invoked after every advance.
    pub fn add_listener(&self, listener: Arc<dyn ClockListener>) -> ListenerId {
        ListenerId(self.listeners.lock().insert(listener))
    }

    /// Unregisters a listener. Returns `false` if it was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().try_remove(id.0).is_some()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn notify(&self, now: Time) {
        // Copy out so listeners can (un)register while being notified.
        let snapshot: SmallVec<[Arc<dyn ClockListener>; 8]> =
            self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in snapshot {
            listener.on_advance(now);
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Time {
        Self::now(self)
    }
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualClock")
            .field("now", &self.now())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::AtomicUsize;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn advance_by_moves_forward_exactly() {
        init_test("advance_by_moves_forward_exactly");
        let clock = VirtualClock::starting_at(Time::from_millis(100));
        let after = clock.advance_by(Duration::from_millis(16));
        crate::assert_with_log!(
            after == Time::from_millis(116),
            "advance_by result",
            Time::from_millis(116),
            after
        );
        assert_eq!(clock.now(), after);
        crate::test_complete!("advance_by_moves_forward_exactly");
    }

    #[test]
    fn advance_to_rejects_past_and_keeps_time() {
        init_test("advance_to_rejects_past_and_keeps_time");
        let clock = VirtualClock::starting_at(Time::from_millis(100));
        let err = clock.advance_to(Time::from_millis(99)).unwrap_err();
        crate::assert_with_log!(
            err.kind() == crate::error::ErrorKind::InvalidArgument,
            "moving backwards is an invalid argument",
            crate::error::ErrorKind::InvalidArgument,
            err.kind()
        );
        assert_eq!(clock.now(), Time::from_millis(100));
        clock.advance_to(Time::from_millis(100)).unwrap();
        crate::test_complete!("advance_to_rejects_past_and_keeps_time");
    }

    #[test]
    fn listeners_see_new_time_synchronously() {
        init_test("listeners_see_new_time_synchronously");
        let clock = Arc::new(VirtualClock::new());
        let seen = Arc::new(AtomicU64::new(0));
        let observer = Arc::clone(&clock);
        let seen_in = Arc::clone(&seen);
        let _id = clock.add_listener(Arc::new(move |now: Time| {
            assert_eq!(observer.now(), now);
            seen_in.store(now.as_nanos(), Ordering::SeqCst);
        }));
        clock.advance_by(Duration::from_millis(5));
        assert_eq!(seen.load(Ordering::SeqCst), Time::from_millis(5).as_nanos());
        crate::test_complete!("listeners_see_new_time_synchronously");
    }

    #[test]
    fn failed_advance_does_not_notify() {
        init_test("failed_advance_does_not_notify");
        let clock = VirtualClock::starting_at(Time::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _id = clock.add_listener(Arc::new(move |_now: Time| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(clock.advance_to(Time::from_millis(1)).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        crate::test_complete!("failed_advance_does_not_notify");
    }

    #[test]
    fn listener_may_remove_itself_while_notified() {
        init_test("listener_may_remove_itself_while_notified");
        let clock = Arc::new(VirtualClock::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let clock_in = Arc::clone(&clock);
        let slot_in = Arc::clone(&slot);
        let calls_in = Arc::clone(&calls);
        let id = clock.add_listener(Arc::new(move |_now: Time| {
            calls_in.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = slot_in.lock().take() {
                clock_in.remove_listener(id);
            }
        }));
        *slot.lock() = Some(id);

        clock.advance_by(Duration::from_millis(1));
        clock.advance_by(Duration::from_millis(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(clock.listener_count(), 0);
        crate::test_complete!("listener_may_remove_itself_while_notified");
    }

    #[test]
    fn reset_may_go_backwards_silently() {
        init_test("reset_may_go_backwards_silently");
        let clock = VirtualClock::starting_at(Time::from_millis(500));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = clock.add_listener(Arc::new(move |_now: Time| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        clock.reset(Time::from_millis(100));
        assert_eq!(clock.now(), Time::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(clock.remove_listener(id));
        crate::test_complete!("reset_may_go_backwards_silently");
    }
}
