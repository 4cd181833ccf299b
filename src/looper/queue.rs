//! The per-loop task queue.
//!
//! Tasks are kept in a `BTreeMap` keyed by [`TaskKey`] so the earliest due
//! task is always the first eligible entry. The single consumer (the loop
//! thread) parks on a condition variable; only an insert, a clock advance, a
//! barrier removal, quitting or an explicit [`wake`](TaskQueue::wake) unparks it.
//!
//! Synchronization barriers hold back every synchronous task regardless of
//! its time. Asynchronous tasks, which include everything a controller or a
//! frame clock submits, pass a barrier.

use crate::error::{Error, Result};
use crate::looper::control::ControlTask;
use crate::looper::task::{Action, Lane, ScheduledTask, TaskHandle, TaskKey, Work};
use crate::time::{ClockListener, ListenerId, VirtualClock};
use crate::tracing_compat::{debug, trace};
use crate::types::{BarrierToken, IdleCallbackId, PanicPayload, QueueId, Time};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Returned by an idle callback to say whether it wants to hear about the next idle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    /// Stay registered.
    Continue,
    /// Unregister after this call.
    Done,
}

/// Hook invoked when a queue runs out of due work.
pub trait IdleCallback: Send + Sync {
    /// Called on the loop thread with no queue lock held.
    fn on_idle(&self) -> IdleDecision;
}

impl<F> IdleCallback for F
where
    F: Fn() -> IdleDecision + Send + Sync,
{
    fn on_idle(&self) -> IdleDecision {
        self()
    }
}

pub(crate) type IdleCallbacks = SmallVec<[(IdleCallbackId, Arc<dyn IdleCallback>); 4]>;

/// Where a new task goes.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Placement {
    At(Time),
    Front,
}

struct Entry {
    asynchronous: bool,
    work: Work,
}

struct QueueInner {
    tasks: BTreeMap<TaskKey, Entry>,
    barriers: BTreeSet<BarrierToken>,
    idle_callbacks: Vec<(IdleCallbackId, Arc<dyn IdleCallback>)>,
    next_seq: u64,
    next_barrier: u32,
    next_idle_id: u64,
    quitting: bool,
    polling: bool,
    pending_wake: bool,
    uncaught: Option<Arc<PanicPayload>>,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            barriers: BTreeSet::new(),
            idle_callbacks: Vec::new(),
            next_seq: 0,
            next_barrier: 0,
            next_idle_id: 0,
            quitting: false,
            polling: false,
            pending_wake: false,
            uncaught: None,
        }
    }

    fn blocked(&self, entry: &Entry) -> bool {
        !self.barriers.is_empty() && !entry.asynchronous
    }

    /// First task that may run at `now`.
    fn first_due(&self, now: Time) -> Option<TaskKey> {
        for (key, entry) in &self.tasks {
            if key.lane == Lane::Timed && key.when > now {
                break;
            }
            if !self.blocked(entry) {
                return Some(*key);
            }
        }
        None
    }

    /// First task that may run at any time, ignoring its target time.
    fn first_eligible(&self) -> Option<TaskKey> {
        self.tasks
            .iter()
            .find(|(_, entry)| !self.blocked(entry))
            .map(|(key, _)| *key)
    }

    fn take(&mut self, key: TaskKey) -> Option<ScheduledTask> {
        self.tasks.remove(&key).map(|entry| ScheduledTask {
            key,
            asynchronous: entry.asynchronous,
            work: entry.work,
        })
    }

    fn take_due(&mut self, now: Time) -> Option<ScheduledTask> {
        let key = self.first_due(now)?;
        self.take(key)
    }

    fn is_idle(&self, now: Time) -> bool {
        self.barriers.is_empty() && self.first_due(now).is_none()
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&TaskKey, &Entry) -> bool) -> Vec<Entry> {
        let doomed: Vec<TaskKey> = self
            .tasks
            .iter()
            .filter(|(key, entry)| pred(key, entry))
            .map(|(key, _)| *key)
            .collect();
        doomed
            .into_iter()
            .filter_map(|key| self.tasks.remove(&key))
            .collect()
    }
}

/// Ordered collection of pending work for one loop.
///
/// Any thread may insert; only the owning loop thread takes tasks out.
pub struct TaskQueue {
    id: QueueId,
    clock: Arc<VirtualClock>,
    inner: Mutex<QueueInner>,
    available: Condvar,
    listener: Mutex<Option<ListenerId>>,
}

/// Wakes the consumer when a clock advance makes work due.
struct QueueWaker {
    queue: Weak<TaskQueue>,
}

impl ClockListener for QueueWaker {
    fn on_advance(&self, now: Time) {
        if let Some(queue) = self.queue.upgrade() {
            queue.on_clock_advanced(now);
        }
    }
}

impl TaskQueue {
    /// Creates a queue ordered against `clock` and subscribes it to clock advances.
    #[must_use]
    pub fn new(clock: Arc<VirtualClock>) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let id = clock.add_listener(Arc::new(QueueWaker {
                queue: weak.clone(),
            }));
            Self {
                id: QueueId::next(),
                clock,
                inner: Mutex::new(QueueInner::new()),
                available: Condvar::new(),
                listener: Mutex::new(Some(id)),
            }
        })
    }

    /// The clock this queue orders against.
    #[must_use]
    pub fn clock(&self) -> &Arc<VirtualClock> {
        &self.clock
    }

    /// Fails with [`Error::LoopThreadDied`] once the consuming thread has died from a panic.
    pub fn check_state(&self) -> Result<()> {
        match &self.inner.lock().uncaught {
            Some(cause) => Err(Error::LoopThreadDied(Arc::clone(cause))),
            None => Ok(()),
        }
    }

    /// Schedules `action` at `when`.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] once the queue is quitting,
    /// [`Error::LoopThreadDied`] if the loop thread died.
    pub fn enqueue<F>(&self, action: F, when: Time) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Work::Action(Box::new(action)), Placement::At(when), false)
    }

    /// Schedules an asynchronous `action` at `when`; it is not held back by barriers.
    pub fn enqueue_async<F>(&self, action: F, when: Time) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Work::Action(Box::new(action)), Placement::At(when), true)
    }

    /// Schedules `action` ahead of every other task.
    pub fn enqueue_at_front<F>(&self, action: F) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Work::Action(Box::new(action)), Placement::Front, false)
    }

    /// Boxed form of [`enqueue`](Self::enqueue).
    pub fn enqueue_boxed(&self, action: Action, when: Time) -> Result<TaskHandle> {
        self.push(Work::Action(action), Placement::At(when), false)
    }

    pub(crate) fn push(
        &self,
        work: Work,
        placement: Placement,
        asynchronous: bool,
    ) -> Result<TaskHandle> {
        let mut inner = self.inner.lock();
        if let Some(cause) = &inner.uncaught {
            return Err(Error::LoopThreadDied(Arc::clone(cause)));
        }
        if inner.quitting {
            return Err(Error::illegal_state(
                "sending a task to a loop whose queue is quitting",
            ));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let key = match placement {
            Placement::At(when) => TaskKey {
                lane: Lane::Timed,
                when,
                seq,
            },
            Placement::Front => TaskKey {
                lane: Lane::Front,
                when: self.clock.now(),
                seq,
            },
        };
        trace!(queue = ?self.id, when = %key.when, seq, asynchronous, "task enqueued");
        inner.tasks.insert(key, Entry { asynchronous, work });
        inner.pending_wake = true;
        drop(inner);
        self.available.notify_all();
        Ok(TaskHandle { queue: self.id, key })
    }

    /// Removes a task that has not run yet. Returns `false` if it already ran or was removed.
    pub fn remove(&self, handle: &TaskHandle) -> bool {
        if handle.queue != self.id {
            return false;
        }
        let removed = self.inner.lock().tasks.remove(&handle.key);
        match removed {
            Some(entry) => {
                if let Some(task) = entry.work.control_task() {
                    task.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Whether the task is still waiting in this queue.
    #[must_use]
    pub fn contains(&self, handle: &TaskHandle) -> bool {
        handle.queue == self.id && self.inner.lock().tasks.contains_key(&handle.key)
    }

    /// Removes and returns the earliest task due at `now`, or `None`. Never blocks.
    pub fn peek_due(&self, now: Time) -> Option<ScheduledTask> {
        self.inner.lock().take_due(now)
    }

    /// [`peek_due`](Self::peek_due) at the clock's current time.
    pub(crate) fn take_due(&self) -> Option<ScheduledTask> {
        self.inner.lock().take_due(self.clock.now())
    }

    /// Blocks until a task is due, `timeout` elapses, the queue is woken, or it quits.
    ///
    /// `None` as timeout waits indefinitely. Only the loop's own thread calls this.
    pub fn blocking_poll(&self, timeout: Option<Duration>) -> Option<ScheduledTask> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if let Some(task) = inner.take_due(self.clock.now()) {
                return Some(task);
            }
            if inner.quitting {
                return None;
            }
            if inner.pending_wake {
                inner.pending_wake = false;
                return None;
            }
            inner.polling = true;
            let timed_out = match deadline {
                Some(deadline) => self.available.wait_until(&mut inner, deadline).timed_out(),
                None => {
                    self.available.wait(&mut inner);
                    false
                }
            };
            inner.polling = false;
            if timed_out {
                return inner.take_due(self.clock.now());
            }
        }
    }

    /// Unblocks a consumer parked in [`blocking_poll`](Self::blocking_poll).
    pub fn wake(&self) {
        self.inner.lock().pending_wake = true;
        self.available.notify_all();
    }

    fn on_clock_advanced(&self, now: Time) {
        let mut inner = self.inner.lock();
        if inner.first_due(now).is_some() {
            inner.pending_wake = true;
            drop(inner);
            self.available.notify_all();
        }
    }

    /// `true` when nothing may run now: no due task, and no barrier up.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.lock().is_idle(self.clock.now())
    }

    /// Whether the consumer is currently parked in [`blocking_poll`](Self::blocking_poll).
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.inner.lock().polling
    }

    /// Whether [`quit`](Self::quit) has been called.
    #[must_use]
    pub fn is_quitting(&self) -> bool {
        self.inner.lock().quitting
    }

    /// Number of queued tasks, due or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// `true` when no task is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().tasks.is_empty()
    }

    /// Target time of the next task that could run, floored to now; [`Time::ZERO`] if none.
    ///
    /// Tasks held back by a barrier are not counted.
    #[must_use]
    pub fn next_scheduled_task_time(&self) -> Time {
        let inner = self.inner.lock();
        let now = self.clock.now();
        inner.first_eligible().map_or(Time::ZERO, |key| key.when.max(now))
    }

    /// Latest target time of any queued task, floored to now; [`Time::ZERO`] if none.
    #[must_use]
    pub fn last_scheduled_task_time(&self) -> Time {
        let inner = self.inner.lock();
        let now = self.clock.now();
        inner
            .tasks
            .keys()
            .map(|key| key.when)
            .max()
            .map_or(Time::ZERO, |when| when.max(now))
    }

    /// Registers an idle callback.
    pub fn add_idle_callback<C>(&self, callback: C) -> IdleCallbackId
    where
        C: IdleCallback + 'static,
    {
        self.add_idle_callback_arc(Arc::new(callback))
    }

    /// Registers a shared idle callback.
    pub fn add_idle_callback_arc(&self, callback: Arc<dyn IdleCallback>) -> IdleCallbackId {
        let mut inner = self.inner.lock();
        let id = IdleCallbackId::new(inner.next_idle_id);
        inner.next_idle_id += 1;
        inner.idle_callbacks.push((id, callback));
        id
    }

    /// Unregisters an idle callback. Returns `false` if it was not registered.
    pub fn remove_idle_callback(&self, id: IdleCallbackId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.idle_callbacks.len();
        inner.idle_callbacks.retain(|(existing, _)| *existing != id);
        inner.idle_callbacks.len() != before
    }

    /// Number of registered idle callbacks.
    #[must_use]
    pub fn idle_callback_count(&self) -> usize {
        self.inner.lock().idle_callbacks.len()
    }

    pub(crate) fn idle_callbacks(&self) -> IdleCallbacks {
        self.inner
            .lock()
            .idle_callbacks
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect()
    }

    /// Puts up a synchronization barrier.
    pub fn insert_barrier(&self) -> Result<BarrierToken> {
        let mut inner = self.inner.lock();
        if let Some(cause) = &inner.uncaught {
            return Err(Error::LoopThreadDied(Arc::clone(cause)));
        }
        let token = BarrierToken::new(inner.next_barrier);
        inner.next_barrier += 1;
        inner.barriers.insert(token);
        Ok(token)
    }

    /// Takes down a barrier and wakes the consumer.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] if the token was never handed out or is already removed.
    pub fn remove_barrier(&self, token: BarrierToken) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.barriers.remove(&token) {
            return Err(Error::illegal_state(format!(
                "synchronization barrier {} has not been posted or has already been removed",
                token.get()
            )));
        }
        inner.pending_wake = true;
        drop(inner);
        self.available.notify_all();
        Ok(())
    }

    /// Number of barriers currently up.
    #[must_use]
    pub fn barrier_count(&self) -> usize {
        self.inner.lock().barriers.len()
    }

    /// Stops accepting tasks.
    ///
    /// With `safely` only tasks due later than now are discarded and due ones
    /// still run; otherwise everything pending is discarded. Idempotent.
    pub fn quit(&self, safely: bool) {
        let discarded = {
            let mut inner = self.inner.lock();
            if inner.quitting {
                return;
            }
            inner.quitting = true;
            let now = self.clock.now();
            let discarded = if safely {
                inner.remove_where(|key, _| key.lane == Lane::Timed && key.when > now)
            } else {
                inner.remove_where(|_, _| true)
            };
            inner.pending_wake = true;
            discarded
        };
        self.available.notify_all();
        debug!(queue = ?self.id, safely, discarded = discarded.len(), "queue quitting");
        cancel_entries(discarded);
        if let Some(id) = self.listener.lock().take() {
            self.clock.remove_listener(id);
        }
    }

    /// Clears tasks, barriers, idle callbacks and any recorded panic.
    ///
    /// A quitting queue stays quitting.
    pub fn reset(&self) {
        let discarded = {
            let mut inner = self.inner.lock();
            let discarded = inner.remove_where(|_, _| true);
            inner.barriers.clear();
            inner.next_barrier = 0;
            inner.idle_callbacks.clear();
            inner.uncaught = None;
            inner.pending_wake = true;
            discarded
        };
        self.available.notify_all();
        cancel_entries(discarded);
    }

    /// Records the panic that killed (or crashed) the consuming thread.
    pub(crate) fn set_uncaught(&self, cause: Arc<PanicPayload>) {
        self.inner.lock().uncaught = Some(cause);
    }

    /// Removes every queued controller task and hands them back uncancelled.
    pub(crate) fn drain_control(&self) -> Vec<Arc<ControlTask>> {
        let drained = self
            .inner
            .lock()
            .remove_where(|_, entry| entry.work.control_task().is_some());
        drained
            .into_iter()
            .filter_map(|entry| entry.work.control_task().cloned())
            .collect()
    }
}

fn cancel_entries(entries: Vec<Entry>) {
    for entry in entries {
        if let Some(task) = entry.work.control_task() {
            task.cancel();
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        if let Some(id) = self.listener.get_mut().take() {
            self.clock.remove_listener(id);
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TaskQueue")
            .field("id", &self.id)
            .field("tasks", &inner.tasks.len())
            .field("barriers", &inner.barriers.len())
            .field("idle_callbacks", &inner.idle_callbacks.len())
            .field("quitting", &inner.quitting)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn queue_at(ms: u64) -> (Arc<VirtualClock>, Arc<TaskQueue>) {
        let clock = Arc::new(VirtualClock::starting_at(Time::from_millis(ms)));
        let queue = TaskQueue::new(Arc::clone(&clock));
        (clock, queue)
    }

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Action) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |name: &'static str| -> Action {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().push(name))
        };
        (log, make)
    }

    fn drain(queue: &TaskQueue) {
        while let Some(task) = queue.take_due() {
            task.run();
        }
    }

    #[test]
    fn equal_time_tasks_run_in_submission_order() {
        init_test("equal_time_tasks_run_in_submission_order");
        let (_clock, queue) = queue_at(100);
        let (log, make) = recorder();
        let now = Time::from_millis(100);
        queue.enqueue_boxed(make("a"), now).unwrap();
        queue.enqueue_boxed(make("b"), now).unwrap();
        queue.enqueue_boxed(make("c"), now).unwrap();
        drain(&queue);
        let order = log.lock().clone();
        crate::assert_with_log!(order == ["a", "b", "c"], "fifo at equal time", ["a", "b", "c"], order);
        crate::test_complete!("equal_time_tasks_run_in_submission_order");
    }

    #[test]
    fn future_tasks_wait_for_the_clock() {
        init_test("future_tasks_wait_for_the_clock");
        let (clock, queue) = queue_at(100);
        let (log, make) = recorder();
        queue.enqueue_boxed(make("late"), Time::from_millis(150)).unwrap();
        queue.enqueue_boxed(make("early"), Time::from_millis(120)).unwrap();
        assert!(queue.is_idle());
        assert_eq!(queue.next_scheduled_task_time(), Time::from_millis(120));
        assert_eq!(queue.last_scheduled_task_time(), Time::from_millis(150));

        clock.advance_to(Time::from_millis(130)).unwrap();
        assert!(!queue.is_idle());
        drain(&queue);
        assert_eq!(*log.lock(), ["early"]);

        clock.advance_to(Time::from_millis(150)).unwrap();
        drain(&queue);
        assert_eq!(*log.lock(), ["early", "late"]);
        assert_eq!(queue.next_scheduled_task_time(), Time::ZERO);
        assert_eq!(queue.last_scheduled_task_time(), Time::ZERO);
        crate::test_complete!("future_tasks_wait_for_the_clock");
    }

    #[test]
    fn overdue_task_times_floor_to_now() {
        init_test("overdue_task_times_floor_to_now");
        let (_clock, queue) = queue_at(100);
        queue.enqueue(|| {}, Time::from_millis(10)).unwrap();
        assert_eq!(queue.next_scheduled_task_time(), Time::from_millis(100));
        assert_eq!(queue.last_scheduled_task_time(), Time::from_millis(100));
        crate::test_complete!("overdue_task_times_floor_to_now");
    }

    #[test]
    fn front_inserts_jump_the_queue() {
        init_test("front_inserts_jump_the_queue");
        let (_clock, queue) = queue_at(100);
        let (log, make) = recorder();
        queue.enqueue_boxed(make("old"), Time::from_millis(50)).unwrap();
        queue.push(Work::Action(make("front1")), Placement::Front, false).unwrap();
        queue.push(Work::Action(make("front2")), Placement::Front, false).unwrap();
        drain(&queue);
        assert_eq!(*log.lock(), ["front2", "front1", "old"]);
        crate::test_complete!("front_inserts_jump_the_queue");
    }

    #[test]
    fn removed_task_never_runs() {
        init_test("removed_task_never_runs");
        let (_clock, queue) = queue_at(100);
        let (log, make) = recorder();
        let handle = queue.enqueue_boxed(make("gone"), Time::from_millis(100)).unwrap();
        assert!(queue.contains(&handle));
        assert!(queue.remove(&handle));
        assert!(!queue.remove(&handle));
        drain(&queue);
        assert!(log.lock().is_empty());
        crate::test_complete!("removed_task_never_runs");
    }

    #[test]
    fn handles_from_other_queues_are_ignored() {
        init_test("handles_from_other_queues_are_ignored");
        let (clock, queue) = queue_at(100);
        let other = TaskQueue::new(clock);
        let handle = other.enqueue(|| {}, Time::from_millis(100)).unwrap();
        assert!(!queue.remove(&handle));
        assert!(other.contains(&handle));
        crate::test_complete!("handles_from_other_queues_are_ignored");
    }

    #[test]
    fn barrier_holds_back_sync_tasks_only() {
        init_test("barrier_holds_back_sync_tasks_only");
        let (_clock, queue) = queue_at(100);
        let (log, make) = recorder();
        let token = queue.insert_barrier().unwrap();
        queue.enqueue_boxed(make("sync"), Time::from_millis(100)).unwrap();
        queue
            .push(Work::Action(make("async")), Placement::At(Time::from_millis(100)), true)
            .unwrap();
        assert!(!queue.is_idle(), "a barrier reports not idle");
        drain(&queue);
        assert_eq!(*log.lock(), ["async"]);
        assert_eq!(queue.next_scheduled_task_time(), Time::ZERO);

        queue.remove_barrier(token).unwrap();
        drain(&queue);
        assert_eq!(*log.lock(), ["async", "sync"]);
        assert!(queue.is_idle());
        crate::test_complete!("barrier_holds_back_sync_tasks_only");
    }

    #[test]
    fn removing_unknown_barrier_is_illegal_state() {
        init_test("removing_unknown_barrier_is_illegal_state");
        let (_clock, queue) = queue_at(100);
        let token = queue.insert_barrier().unwrap();
        queue.remove_barrier(token).unwrap();
        let err = queue.remove_barrier(token).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalState);
        crate::test_complete!("removing_unknown_barrier_is_illegal_state");
    }

    #[test]
    fn enqueue_after_quit_fails_fast() {
        init_test("enqueue_after_quit_fails_fast");
        let (clock, queue) = queue_at(100);
        assert_eq!(clock.listener_count(), 1);
        queue.quit(false);
        let err = queue.enqueue(|| {}, Time::from_millis(100)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalState);
        assert_eq!(clock.listener_count(), 0, "quitting unsubscribes from the clock");
        crate::test_complete!("enqueue_after_quit_fails_fast");
    }

    #[test]
    fn quit_safely_keeps_due_tasks() {
        init_test("quit_safely_keeps_due_tasks");
        let (_clock, queue) = queue_at(100);
        let (log, make) = recorder();
        queue.enqueue_boxed(make("due"), Time::from_millis(100)).unwrap();
        queue.enqueue_boxed(make("future"), Time::from_millis(200)).unwrap();
        queue.quit(true);
        assert_eq!(queue.len(), 1);
        drain(&queue);
        assert_eq!(*log.lock(), ["due"]);
        crate::test_complete!("quit_safely_keeps_due_tasks");
    }

    #[test]
    fn uncaught_panic_poisons_every_operation() {
        init_test("uncaught_panic_poisons_every_operation");
        let (_clock, queue) = queue_at(100);
        queue.set_uncaught(Arc::new(PanicPayload::new("boom")));
        for _ in 0..2 {
            let err = queue.enqueue(|| {}, Time::from_millis(100)).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::LoopThreadDied);
            assert!(queue.check_state().is_err());
        }
        queue.reset();
        assert!(queue.check_state().is_ok());
        crate::test_complete!("uncaught_panic_poisons_every_operation");
    }

    #[test]
    fn reset_clears_everything_but_quitting() {
        init_test("reset_clears_everything_but_quitting");
        let (_clock, queue) = queue_at(100);
        queue.enqueue(|| {}, Time::from_millis(300)).unwrap();
        queue.insert_barrier().unwrap();
        queue.add_idle_callback(|| IdleDecision::Continue);
        queue.reset();
        assert!(queue.is_empty());
        assert_eq!(queue.barrier_count(), 0);
        assert_eq!(queue.idle_callback_count(), 0);
        assert_eq!(queue.insert_barrier().unwrap().get(), 0, "tokens restart");
        crate::test_complete!("reset_clears_everything_but_quitting");
    }

    #[test]
    fn idle_callbacks_register_and_unregister() {
        init_test("idle_callbacks_register_and_unregister");
        let (_clock, queue) = queue_at(100);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = queue.add_idle_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            IdleDecision::Continue
        });
        for (_, cb) in queue.idle_callbacks() {
            assert_eq!(cb.on_idle(), IdleDecision::Continue);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.remove_idle_callback(id));
        assert!(!queue.remove_idle_callback(id));
        crate::test_complete!("idle_callbacks_register_and_unregister");
    }

    #[test]
    fn blocking_poll_times_out_without_work() {
        init_test("blocking_poll_times_out_without_work");
        let (_clock, queue) = queue_at(100);
        queue.blocking_poll(Some(Duration::ZERO));
        assert!(queue.blocking_poll(Some(Duration::from_millis(5))).is_none());
        assert!(!queue.is_polling());
        crate::test_complete!("blocking_poll_times_out_without_work");
    }

    #[test]
    fn clock_advance_wakes_blocked_consumer() {
        init_test("clock_advance_wakes_blocked_consumer");
        let (clock, queue) = queue_at(100);
        queue.enqueue(|| {}, Time::from_millis(200)).unwrap();
        // Consume the wake flag left by the enqueue.
        assert!(queue.blocking_poll(Some(Duration::ZERO)).is_none());

        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.blocking_poll(Some(Duration::from_secs(10))))
        };
        while !queue.is_polling() {
            std::thread::yield_now();
        }
        clock.advance_to(Time::from_millis(200)).unwrap();
        let task = consumer.join().unwrap();
        crate::assert_with_log!(
            task.as_ref().map(ScheduledTask::target_time) == Some(Time::from_millis(200)),
            "woken consumer gets the now-due task",
            Some(Time::from_millis(200)),
            task.as_ref().map(ScheduledTask::target_time)
        );
        crate::test_complete!("clock_advance_wakes_blocked_consumer");
    }

    #[test]
    fn explicit_wake_returns_none() {
        init_test("explicit_wake_returns_none");
        let (_clock, queue) = queue_at(100);
        queue.wake();
        assert!(queue.blocking_poll(None).is_none());
        crate::test_complete!("explicit_wake_returns_none");
    }
}
