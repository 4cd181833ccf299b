//! The event loop: one task queue drained by one OS thread.
//!
//! A [`Looper`] is a cheap cloneable handle. The loop thread alternates
//! between three places:
//!
//! - normal dispatch, when the loop is running: block on the queue, dispatch
//!   whatever becomes due, fire idle callbacks whenever the queue drains;
//! - the pause-wait in [`LoopController`], when paused: only controller tasks run;
//! - the crash-wait in [`LoopController`], main loop only, after a panic
//!   escaped dispatch.
//!
//! The test-control surface ([`idle`](Looper::idle),
//! [`idle_for`](Looper::idle_for), [`run_one_task`](Looper::run_one_task)
//! and friends) is built from controller tasks, so it behaves the same
//! whether the loop is running or paused, and whether it is called from the
//! loop thread or from the test driver.

use crate::config::LooperMode;
use crate::error::{Error, Result};
use crate::looper::control::{Fault, LoopController, Uncaught};
use crate::looper::queue::{IdleCallback, IdleDecision, TaskQueue};
use crate::looper::state::{LoopRole, LoopState};
use crate::looper::task::{ScheduledTask, TaskHandle, Work};
use crate::observability::{LoopMetrics, LoopMetricsSnapshot};
use crate::time::VirtualClock;
use crate::tracing_compat::{debug, error, trace, warn};
use crate::types::panic::catch_panic;
use crate::types::{BarrierToken, IdleCallbackId, LoopId, Time};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

struct LooperShared {
    id: LoopId,
    name: Arc<str>,
    role: LoopRole,
    queue: Arc<TaskQueue>,
    controller: LoopController,
    metrics: Arc<LoopMetrics>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to an event loop and its thread.
#[derive(Clone)]
pub struct Looper {
    shared: Arc<LooperShared>,
}

/// Point-in-time view of a loop, for assertions and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LooperSnapshot {
    /// Loop id.
    pub id: LoopId,
    /// Thread name.
    pub name: String,
    /// Main or background.
    pub role: LoopRole,
    /// Control state.
    pub state: LoopState,
    /// Queued tasks, due or not.
    pub queued_tasks: usize,
    /// Synchronization barriers up.
    pub barriers: usize,
    /// Registered idle callbacks.
    pub idle_callbacks: usize,
    /// See [`Looper::next_scheduled_task_time`].
    pub next_scheduled_task_time: Time,
    /// See [`Looper::last_scheduled_task_time`].
    pub last_scheduled_task_time: Time,
    /// Activity counters.
    pub metrics: LoopMetricsSnapshot,
}

impl Looper {
    /// Starts a loop thread named `name`.
    pub(crate) fn spawn(
        name: &str,
        role: LoopRole,
        mode: LooperMode,
        clock: Arc<VirtualClock>,
    ) -> Result<Self> {
        let name: Arc<str> = Arc::from(name);
        let queue = TaskQueue::new(clock);
        let metrics = Arc::new(LoopMetrics::new());
        let controller = LoopController::new(
            Arc::clone(&name),
            role,
            mode,
            Arc::clone(&queue),
            Arc::clone(&metrics),
        );
        let shared = Arc::new(LooperShared {
            id: LoopId::next(),
            name: Arc::clone(&name),
            role,
            queue,
            controller,
            metrics,
            thread: Mutex::new(None),
        });

        let body = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body.thread_main())
            .map_err(|e| Error::Spawn {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        shared.controller.set_owner(handle.thread().id());
        *shared.thread.lock() = Some(handle);
        Ok(Self { shared })
    }

    /// Loop id.
    #[must_use]
    pub fn id(&self) -> LoopId {
        self.shared.id
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Main or background.
    #[must_use]
    pub fn role(&self) -> LoopRole {
        self.shared.role
    }

    /// The loop's task queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.shared.queue
    }

    /// The loop's controller.
    #[must_use]
    pub fn controller(&self) -> &LoopController {
        &self.shared.controller
    }

    /// The clock the loop's queue orders against.
    #[must_use]
    pub fn clock(&self) -> &Arc<VirtualClock> {
        self.shared.queue.clock()
    }

    /// Activity counters.
    #[must_use]
    pub fn metrics(&self) -> &LoopMetrics {
        &self.shared.metrics
    }

    /// Whether the caller is this loop's thread.
    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        self.shared.controller.is_loop_thread()
    }

    /// Current control state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.shared.controller.state()
    }

    /// `true` while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.controller.is_paused()
    }

    /// See [`LoopController::pause`].
    pub fn pause(&self) -> Result<()> {
        self.shared.controller.pause()
    }

    /// See [`LoopController::unpause`].
    pub fn unpause(&self) -> Result<()> {
        self.shared.controller.unpause()
    }

    /// See [`LoopController::reinitialize`].
    pub fn reinitialize(&self) -> Result<()> {
        self.shared.controller.reinitialize()
    }

    /// Runs every task due now, including ones they post that are also due now.
    ///
    /// Idle callbacks fire each time the queue drains. Works on a running or
    /// a paused loop and from any thread.
    ///
    /// # Errors
    ///
    /// A panic in dispatched work is returned here; on the main loop the loop
    /// is [`Crashed`](LoopState::Crashed) by the time this returns.
    pub fn idle(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        self.shared.controller.execute(
            "idle",
            true,
            Box::new(move || shared.drain_due().map_err(Fault::Uncaught)),
        )
    }

    /// Advances the clock by `duration`, running tasks as their times come up.
    ///
    /// The clock visits every intermediate task time in order, so a task
    /// observes the clock at its own target time. A final drain runs after
    /// the last advance to catch work posted by clock listeners.
    pub fn idle_for(&self, duration: Duration) -> Result<()> {
        let clock = self.clock();
        let end = clock.now() + duration;
        loop {
            let next = self.shared.queue.next_scheduled_task_time();
            if next == Time::ZERO || next > end {
                break;
            }
            clock.advance_to(next.max(clock.now()))?;
            self.idle()?;
        }
        clock.advance_to(end.max(clock.now()))?;
        self.idle()
    }

    /// Dispatches at most one due task.
    pub fn run_one_task(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        self.shared.controller.execute(
            "run_one_task",
            true,
            Box::new(move || {
                let Some(task) = shared.queue.take_due() else {
                    return Ok(());
                };
                shared.dispatch(task).map_err(Fault::Uncaught)?;
                if shared.queue.is_idle() {
                    shared.fire_idle_callbacks().map_err(Fault::Uncaught)?;
                }
                Ok(())
            }),
        )
    }

    /// Advances to the next scheduled task and runs everything due by then.
    pub fn run_to_next_task(&self) -> Result<()> {
        let next = self.shared.queue.next_scheduled_task_time();
        self.idle_until(next)
    }

    /// Advances to the last scheduled task and runs everything due by then.
    pub fn run_to_end_of_tasks(&self) -> Result<()> {
        let last = self.shared.queue.last_scheduled_task_time();
        self.idle_until(last)
    }

    fn idle_until(&self, target: Time) -> Result<()> {
        if target == Time::ZERO {
            return self.idle();
        }
        self.idle_for(target.saturating_duration_since(self.clock().now()))
    }

    /// Drains due tasks on the loop's own thread.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] from any other thread.
    pub fn run_until_idle(&self) -> Result<()> {
        if !self.is_current_thread() {
            return Err(Error::illegal_state(format!(
                "run_until_idle must be called from the thread of loop `{}`",
                self.shared.name
            )));
        }
        self.idle()
    }

    /// Target time of the next task that could run, or [`Time::ZERO`].
    #[must_use]
    pub fn next_scheduled_task_time(&self) -> Time {
        self.shared.queue.next_scheduled_task_time()
    }

    /// Latest target time of any queued task, or [`Time::ZERO`].
    #[must_use]
    pub fn last_scheduled_task_time(&self) -> Time {
        self.shared.queue.last_scheduled_task_time()
    }

    /// Posts `action` to run as soon as possible.
    pub fn post<F>(&self, action: F) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let now = self.clock().now();
        self.shared.queue.enqueue(action, now)
    }

    /// Posts `action` to run `delay` from now.
    pub fn post_delayed<F>(&self, action: F, delay: Duration) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let when = self.clock().now() + delay;
        self.shared.queue.enqueue(action, when)
    }

    /// Posts `action` to run at uptime `when`.
    pub fn post_at_time<F>(&self, action: F, when: Time) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue.enqueue(action, when)
    }

    /// Posts `action` ahead of everything already queued.
    pub fn post_at_front<F>(&self, action: F) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue.enqueue_at_front(action)
    }

    /// Posts an asynchronous `action`, which synchronization barriers do not hold back.
    pub fn post_async<F>(&self, action: F) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let now = self.clock().now();
        self.shared.queue.enqueue_async(action, now)
    }

    /// Removes a posted task that has not run. Returns `false` if it already ran.
    pub fn remove(&self, handle: &TaskHandle) -> bool {
        self.shared.queue.remove(handle)
    }

    /// Posts `action` and idles the loop until it has run.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] if the action cannot run without advancing the
    /// clock, e.g. because a barrier holds it back; it is then removed.
    pub fn post_sync<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = self.post(move || {
            action();
            flag.store(true, Ordering::Release);
        })?;
        self.idle()?;
        if ran.load(Ordering::Acquire) {
            return Ok(());
        }
        self.shared.queue.remove(&handle);
        Err(Error::illegal_state(format!(
            "task posted to loop `{}` could not run while idling",
            self.shared.name
        )))
    }

    /// Registers an idle callback on the loop's queue.
    pub fn add_idle_callback<C>(&self, callback: C) -> IdleCallbackId
    where
        C: IdleCallback + 'static,
    {
        self.shared.queue.add_idle_callback(callback)
    }

    /// Unregisters an idle callback.
    pub fn remove_idle_callback(&self, id: IdleCallbackId) -> bool {
        self.shared.queue.remove_idle_callback(id)
    }

    /// See [`TaskQueue::insert_barrier`].
    pub fn insert_barrier(&self) -> Result<BarrierToken> {
        self.shared.queue.insert_barrier()
    }

    /// See [`TaskQueue::remove_barrier`].
    pub fn remove_barrier(&self, token: BarrierToken) -> Result<()> {
        self.shared.queue.remove_barrier(token)
    }

    /// Whether the loop has nothing it could run now.
    ///
    /// Seen from another thread, a running loop also has to be parked on its
    /// queue; a task it is still executing keeps it busy.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let queue = &self.shared.queue;
        if !self.is_current_thread() && self.state() == LoopState::Running {
            queue.is_idle() && queue.is_polling()
        } else {
            queue.is_idle()
        }
    }

    /// Stops a background loop.
    ///
    /// With `safely` the tasks due now are still dispatched before the thread
    /// exits, also when the loop is paused; otherwise everything queued is
    /// discarded.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] on the main loop.
    pub fn quit(&self, safely: bool) -> Result<()> {
        if self.shared.role == LoopRole::Main {
            return Err(Error::illegal_state("the main loop is not allowed to quit"));
        }
        self.shared.queue.quit(safely);
        if !safely || self.state() != LoopState::Running {
            self.shared.controller.shutdown();
        }
        debug!(loop_name = %self.shared.name, safely, "loop quit requested");
        Ok(())
    }

    /// Stops the loop regardless of role.
    pub(crate) fn terminate(&self) {
        self.shared.queue.quit(false);
        self.shared.controller.shutdown();
    }

    /// Waits for the loop thread to exit.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] when called from the loop thread itself.
    pub fn join(&self) -> Result<()> {
        if self.is_current_thread() {
            return Err(Error::illegal_state("a loop thread cannot join itself"));
        }
        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(loop_name = %self.shared.name, "loop thread ended by panic");
            }
        }
        Ok(())
    }

    /// Whether the loop thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared
            .thread
            .lock()
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Clears the queue, pending control work and counters.
    pub fn reset_to_initial_state(&self) -> Result<()> {
        self.shared.metrics.reset();
        self.shared.controller.reset()
    }

    /// Point-in-time view for assertions.
    #[must_use]
    pub fn snapshot(&self) -> LooperSnapshot {
        let queue = &self.shared.queue;
        LooperSnapshot {
            id: self.shared.id,
            name: self.shared.name.to_string(),
            role: self.shared.role,
            state: self.state(),
            queued_tasks: queue.len(),
            barriers: queue.barrier_count(),
            idle_callbacks: queue.idle_callback_count(),
            next_scheduled_task_time: queue.next_scheduled_task_time(),
            last_scheduled_task_time: queue.last_scheduled_task_time(),
            metrics: self.shared.metrics.snapshot(),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl LooperShared {
    fn thread_main(self: Arc<Self>) {
        self.controller.set_owner(std::thread::current().id());
        debug!(loop_name = %self.name, role = ?self.role, "loop thread started");
        let clean = loop {
            match self.run_until_quit() {
                Ok(()) => break true,
                Err(uncaught) => {
                    if !self.handle_uncaught(uncaught) {
                        break false;
                    }
                }
            }
        };
        if clean && self.queue.is_quitting() {
            self.finish_quit();
        }
        self.queue.quit(false);
        self.controller.shutdown();
        debug!(loop_name = %self.name, "loop thread exiting");
    }

    /// Runs the due tasks a safe quit left behind, e.g. when the loop was
    /// paused at the time. A non-safe quit leaves nothing to run.
    fn finish_quit(&self) {
        let left = self.queue.len();
        if left == 0 {
            return;
        }
        debug!(loop_name = %self.name, left, "draining due tasks before exit");
        if let Err(uncaught) = self.drain_due() {
            self.metrics.uncaught_panics.increment();
            self.queue.set_uncaught(Arc::clone(&uncaught.cause));
            error!(loop_name = %self.name, cause = %uncaught.cause, "panic while draining on quit");
            uncaught.release();
        }
    }

    fn run_until_quit(&self) -> std::result::Result<(), Uncaught> {
        loop {
            match self.controller.state() {
                LoopState::Paused => {
                    self.controller.run_paused()?;
                    continue;
                }
                LoopState::Terminated => return Ok(()),
                LoopState::Running | LoopState::Crashed => {}
            }
            let Some(task) = self.next_task() else {
                if self.queue.is_quitting() {
                    return Ok(());
                }
                continue;
            };
            self.dispatch(task)?;
            if self.queue.is_idle() {
                self.fire_idle_callbacks()?;
            }
        }
    }

    fn next_task(&self) -> Option<ScheduledTask> {
        if let Some(task) = self.queue.take_due() {
            return Some(task);
        }
        if self.queue.is_quitting() {
            return None;
        }
        self.queue.blocking_poll(None)
    }

    /// Returns whether the loop thread keeps going.
    fn handle_uncaught(&self, uncaught: Uncaught) -> bool {
        self.metrics.uncaught_panics.increment();
        error!(
            loop_name = %self.name,
            role = ?self.role,
            cause = %uncaught.cause,
            "uncaught panic escaped loop dispatch"
        );
        self.queue.set_uncaught(Arc::clone(&uncaught.cause));
        let stranded = self.queue.drain_control();
        trace!(loop_name = %self.name, stranded = stranded.len(), "control tasks pulled from queue");
        match self.role {
            LoopRole::Main => {
                self.controller.crashed(uncaught);
                self.controller.state() != LoopState::Terminated
            }
            LoopRole::Background => {
                uncaught.release();
                self.controller.shutdown();
                false
            }
        }
    }

    fn dispatch(&self, task: ScheduledTask) -> std::result::Result<(), Uncaught> {
        match task.work {
            Work::Action(action) => {
                self.metrics.tasks_dispatched.increment();
                catch_panic(action).map_err(Uncaught::new)
            }
            Work::Control(control) => {
                let outcome = control.run(&self.queue);
                self.controller.retire(&control);
                if outcome? {
                    self.metrics.control_tasks_run.increment();
                }
                Ok(())
            }
            Work::Pause(notifier) => {
                self.controller.begin_pause(&notifier);
                Ok(())
            }
        }
    }

    fn drain_due(&self) -> std::result::Result<(), Uncaught> {
        while let Some(task) = self.queue.take_due() {
            self.dispatch(task)?;
            if self.queue.is_idle() {
                self.fire_idle_callbacks()?;
            }
        }
        Ok(())
    }

    fn fire_idle_callbacks(&self) -> std::result::Result<(), Uncaught> {
        for (id, callback) in self.queue.idle_callbacks() {
            self.metrics.idle_callbacks_fired.increment();
            let decision = catch_panic(|| callback.on_idle()).map_err(Uncaught::new)?;
            if decision == IdleDecision::Done {
                self.queue.remove_idle_callback(id);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
