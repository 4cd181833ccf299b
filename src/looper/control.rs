//! Cross-thread control of a loop.
//!
//! A [`LoopController`] lets a thread other than the loop's own submit work
//! to the loop and block until it has run. Every submitted [`ControlTask`] is
//! recorded in a pending list guarded by the controller monitor:
//!
//! - running loop: the task is also queued (asynchronous, front of queue) and
//!   the loop dispatches it like any other task;
//! - paused loop: the loop thread sits in [`LoopController::run_paused`] and
//!   takes tasks straight from the pending list;
//! - crashed main loop: the loop thread sits in [`LoopController::crashed`],
//!   cancelling cancellable tasks and running only non-cancellable ones
//!   (reinitialization).
//!
//! A loop leaving the pause-wait or crash-wait for normal dispatch queues
//! whatever is still pending, so tasks submitted while it was paused are not
//! stranded.
//!
//! Shutdown, reset and crash handling empty the pending list under the same
//! lock that changes the state, cancelling each task and pulling its queued
//! copy so no caller is left waiting on work that will never run.

use crate::config::LooperMode;
use crate::error::{Error, Result};
use crate::looper::queue::{Placement, TaskQueue};
use crate::looper::state::{LoopRole, LoopState, validate_loop_transition};
use crate::looper::task::{TaskHandle, Work};
use crate::observability::LoopMetrics;
use crate::tracing_compat::{debug, error, trace};
use crate::types::PanicPayload;
use crate::types::panic::catch_panic;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

/// Why a control body did not finish normally.
pub(crate) enum Fault {
    /// Submitted work failed; only the submitter hears about it.
    Action(Error),
    /// A task dispatched on the loop panicked; the loop itself is compromised.
    Uncaught(Uncaught),
}

pub(crate) type ControlBody = Box<dyn FnOnce() -> std::result::Result<(), Fault> + Send>;

/// A panic that escaped dispatch, plus the control tasks that were running
/// around it and must be failed once the loop has reacted.
pub(crate) struct Uncaught {
    pub(crate) cause: Arc<PanicPayload>,
    deferred: Vec<Arc<ControlTask>>,
}

impl Uncaught {
    pub(crate) fn new(cause: Arc<PanicPayload>) -> Self {
        Self {
            cause,
            deferred: Vec::new(),
        }
    }

    /// Fails every deferred task with the panic and returns that error.
    pub(crate) fn release(self) -> Error {
        let error = self.cause.to_error();
        for task in self.deferred {
            task.resolve(Completion::Failed(error.clone()));
        }
        error
    }
}

/// Outcome observed by a waiting submitter.
#[derive(Debug, Clone)]
pub(crate) enum Completion {
    Done,
    Failed(Error),
    Cancelled,
}

enum Phase {
    Pending,
    Running,
    Finished(Completion),
}

/// One unit of controller work with one-shot completion.
pub(crate) struct ControlTask {
    label: &'static str,
    cancellable: bool,
    body: Mutex<Option<ControlBody>>,
    phase: Mutex<Phase>,
    finished: Condvar,
    queued: Mutex<Option<TaskHandle>>,
}

impl ControlTask {
    pub(crate) fn new(label: &'static str, cancellable: bool, body: ControlBody) -> Arc<Self> {
        Arc::new(Self {
            label,
            cancellable,
            body: Mutex::new(Some(body)),
            phase: Mutex::new(Phase::Pending),
            finished: Condvar::new(),
            queued: Mutex::new(None),
        })
    }

    /// A bodiless task resolved by whoever handles it.
    pub(crate) fn marker(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            cancellable: true,
            body: Mutex::new(None),
            phase: Mutex::new(Phase::Pending),
            finished: Condvar::new(),
            queued: Mutex::new(None),
        })
    }

    pub(crate) fn label(&self) -> &'static str {
        self.label
    }

    pub(crate) fn is_cancellable(&self) -> bool {
        self.cancellable
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Pending)
    }

    fn set_queued(&self, handle: TaskHandle) {
        *self.queued.lock() = Some(handle);
    }

    /// Whether the queue still holds this task. A crash pulls control tasks
    /// off the queue without clearing their handle.
    fn is_queued(&self, queue: &TaskQueue) -> bool {
        self.queued.lock().as_ref().is_some_and(|h| queue.contains(h))
    }

    fn unqueue(&self, queue: &TaskQueue) {
        if let Some(handle) = self.queued.lock().take() {
            queue.remove(&handle);
        }
    }

    /// Runs the body on the current thread.
    ///
    /// Returns `Ok(false)` if the task had already run or been cancelled. On
    /// an uncaught panic the task stays unresolved and rides along in the
    /// returned [`Uncaught`].
    pub(crate) fn run(self: &Arc<Self>, queue: &TaskQueue) -> std::result::Result<bool, Uncaught> {
        {
            let mut phase = self.phase.lock();
            if !matches!(*phase, Phase::Pending) {
                return Ok(false);
            }
            *phase = Phase::Running;
        }
        self.unqueue(queue);
        let body = self.body.lock().take();
        let Some(body) = body else {
            self.resolve(Completion::Done);
            return Ok(true);
        };
        match body() {
            Ok(()) => {
                self.resolve(Completion::Done);
                Ok(true)
            }
            Err(Fault::Action(err)) => {
                self.resolve(Completion::Failed(err));
                Ok(true)
            }
            Err(Fault::Uncaught(mut uncaught)) => {
                uncaught.deferred.push(Arc::clone(self));
                Err(uncaught)
            }
        }
    }

    /// Finishes a pending or running task. Returns `false` if it had already finished.
    pub(crate) fn resolve(&self, completion: Completion) -> bool {
        let mut phase = self.phase.lock();
        if matches!(*phase, Phase::Finished(_)) {
            return false;
        }
        *phase = Phase::Finished(completion);
        drop(phase);
        self.finished.notify_all();
        true
    }

    /// Cancels a task that has not started. Returns `false` if it already started.
    pub(crate) fn cancel(&self) -> bool {
        {
            let mut phase = self.phase.lock();
            if !matches!(*phase, Phase::Pending) {
                return false;
            }
            *phase = Phase::Finished(Completion::Cancelled);
        }
        self.body.lock().take();
        self.finished.notify_all();
        true
    }

    fn wait(&self) -> Completion {
        let mut phase = self.phase.lock();
        loop {
            if let Phase::Finished(completion) = &*phase {
                return completion.clone();
            }
            self.finished.wait(&mut phase);
        }
    }
}

impl fmt::Debug for ControlTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match *self.phase.lock() {
            Phase::Pending => "pending",
            Phase::Running => "running",
            Phase::Finished(Completion::Done) => "done",
            Phase::Finished(Completion::Failed(_)) => "failed",
            Phase::Finished(Completion::Cancelled) => "cancelled",
        };
        f.debug_struct("ControlTask")
            .field("label", &self.label)
            .field("cancellable", &self.cancellable)
            .field("phase", &phase)
            .finish_non_exhaustive()
    }
}

struct ControlState {
    state: LoopState,
    pending: VecDeque<Arc<ControlTask>>,
}

/// The monitor shared between a controller and the bodies it submits.
struct Monitor {
    role: LoopRole,
    shared: Mutex<ControlState>,
    signal: Condvar,
}

impl Monitor {
    fn set_state(&self, to: LoopState) -> Result<()> {
        let mut shared = self.shared.lock();
        validate_loop_transition(self.role, shared.state, to)
            .map_err(|e| Error::illegal_state(e.to_string()))?;
        shared.state = to;
        drop(shared);
        self.signal.notify_all();
        Ok(())
    }
}

/// Serialized cross-thread administration of one loop.
pub struct LoopController {
    name: Arc<str>,
    mode: LooperMode,
    queue: Arc<TaskQueue>,
    owner: OnceLock<ThreadId>,
    monitor: Arc<Monitor>,
    metrics: Arc<LoopMetrics>,
}

impl LoopController {
    pub(crate) fn new(
        name: Arc<str>,
        role: LoopRole,
        mode: LooperMode,
        queue: Arc<TaskQueue>,
        metrics: Arc<LoopMetrics>,
    ) -> Self {
        let controller = Self {
            name,
            mode,
            queue,
            owner: OnceLock::new(),
            monitor: Arc::new(Monitor {
                role,
                shared: Mutex::new(ControlState {
                    state: LoopState::Running,
                    pending: VecDeque::new(),
                }),
                signal: Condvar::new(),
            }),
            metrics,
        };
        controller.monitor.shared.lock().state = controller.initial_state();
        controller
    }

    /// State a fresh or reset loop starts in.
    fn initial_state(&self) -> LoopState {
        match (self.monitor.role, self.mode) {
            (LoopRole::Main, LooperMode::Paused) => LoopState::Paused,
            _ => LoopState::Running,
        }
    }

    pub(crate) fn set_owner(&self, thread: ThreadId) {
        let _ = self.owner.set(thread);
    }

    /// Whether the caller is the loop's own thread.
    #[must_use]
    pub fn is_loop_thread(&self) -> bool {
        self.owner.get() == Some(&std::thread::current().id())
    }

    /// Current control state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.monitor.shared.lock().state
    }

    /// `true` while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state() == LoopState::Paused
    }

    /// Control tasks submitted but not yet finished.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.monitor.shared.lock().pending.len()
    }

    /// Runs `action` on the loop thread and waits for it.
    ///
    /// Inline when called from the loop thread. Otherwise the action runs even
    /// if the loop is paused. A panic in `action` is returned as an error
    /// (its [`Error`] payload preserved); cancellation by a concurrent
    /// shutdown, reset or crash is not an error.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] if the loop is terminated,
    /// [`Error::LoopThreadDied`] if its thread died, or the action's own failure.
    pub fn run_on_loop<F>(&self, action: F, cancellable: bool) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(
            "run_on_loop",
            cancellable,
            Box::new(move || catch_panic(action).map_err(|cause| Fault::Action(cause.to_error()))),
        )
    }

    /// Like [`run_on_loop`](Self::run_on_loop) but returns the action's value.
    ///
    /// # Errors
    ///
    /// As `run_on_loop`, plus [`Error::Cancelled`] when the action was cancelled.
    pub fn call_on_loop<T, F>(&self, action: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        self.execute(
            "call_on_loop",
            true,
            Box::new(move || {
                let value = catch_panic(action).map_err(|cause| Fault::Action(cause.to_error()))?;
                *out.lock() = Some(value);
                Ok(())
            }),
        )?;
        let value = slot.lock().take();
        value.ok_or(Error::Cancelled)
    }

    pub(crate) fn execute(
        &self,
        label: &'static str,
        cancellable: bool,
        body: ControlBody,
    ) -> Result<()> {
        if self.is_loop_thread() {
            let state = self.state();
            if state == LoopState::Terminated {
                return Err(self.refusal(state, label));
            }
            return match body() {
                Ok(()) => self.queue.check_state(),
                Err(Fault::Action(err)) => Err(err),
                Err(Fault::Uncaught(uncaught)) => {
                    // Unwind into the dispatch that called us so the loop reacts.
                    let err = uncaught.release();
                    std::panic::resume_unwind(Box::new(err))
                }
            };
        }

        let task = ControlTask::new(label, cancellable, body);
        {
            let mut shared = self.monitor.shared.lock();
            if shared.state == LoopState::Terminated {
                return Err(self.refusal(shared.state, label));
            }
            shared.pending.push_back(Arc::clone(&task));
            if shared.state == LoopState::Running {
                match self
                    .queue
                    .push(Work::Control(Arc::clone(&task)), Placement::Front, true)
                {
                    Ok(handle) => task.set_queued(handle),
                    Err(err) => {
                        shared.pending.pop_back();
                        return Err(err);
                    }
                }
            }
        }
        self.monitor.signal.notify_all();
        self.await_completion(&task)
    }

    fn await_completion(&self, task: &ControlTask) -> Result<()> {
        match task.wait() {
            Completion::Done => {}
            Completion::Failed(err) => return Err(err),
            Completion::Cancelled => {
                trace!(loop_name = %self.name, label = task.label(), "control task cancelled");
            }
        }
        self.queue.check_state()
    }

    /// The error for an operation the current state forbids.
    fn refusal(&self, state: LoopState, what: &str) -> Error {
        self.queue.check_state().err().unwrap_or_else(|| {
            Error::illegal_state(format!("cannot {what} on loop `{}`: it is {state}", self.name))
        })
    }

    /// Pauses the loop. No-op if it is already paused.
    ///
    /// From a foreign thread this blocks until the loop thread has stopped
    /// normal dispatch. From the loop thread the loop is marked paused and
    /// stops dispatching once the current task returns.
    pub fn pause(&self) -> Result<()> {
        if self.is_loop_thread() {
            let state = self.state();
            return match state {
                LoopState::Paused => Ok(()),
                LoopState::Running => {
                    self.monitor.set_state(LoopState::Paused)?;
                    debug!(loop_name = %self.name, "loop paused from its own thread");
                    Ok(())
                }
                other => Err(self.refusal(other, "pause")),
            };
        }

        let notifier = ControlTask::marker("pause");
        {
            let mut shared = self.monitor.shared.lock();
            match shared.state {
                LoopState::Paused => return Ok(()),
                LoopState::Running => {}
                other => return Err(self.refusal(other, "pause")),
            }
            shared.pending.push_back(Arc::clone(&notifier));
            match self
                .queue
                .push(Work::Pause(Arc::clone(&notifier)), Placement::Front, true)
            {
                Ok(handle) => notifier.set_queued(handle),
                Err(err) => {
                    shared.pending.pop_back();
                    return Err(err);
                }
            }
        }
        self.await_completion(&notifier)
    }

    /// Loop thread: handles a dispatched pause request.
    pub(crate) fn begin_pause(&self, notifier: &Arc<ControlTask>) {
        {
            let mut shared = self.monitor.shared.lock();
            shared.pending.retain(|t| !Arc::ptr_eq(t, notifier));
            if !notifier.is_pending() {
                return;
            }
            if shared.state == LoopState::Running {
                shared.state = LoopState::Paused;
                debug!(loop_name = %self.name, "loop paused");
            }
        }
        self.metrics.control_tasks_run.increment();
        notifier.resolve(Completion::Done);
    }

    /// Resumes normal dispatch.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] if the loop is not paused, or if it is the main
    /// loop and the registry is not in [`LooperMode::InstrumentationTest`].
    pub fn unpause(&self) -> Result<()> {
        if self.monitor.role == LoopRole::Main && self.mode != LooperMode::InstrumentationTest {
            return Err(Error::illegal_state(
                "the main loop can only be unpaused in instrumentation test mode",
            ));
        }
        let state = self.state();
        if state != LoopState::Paused {
            return Err(self.refusal(state, "unpause"));
        }
        let monitor = Arc::clone(&self.monitor);
        let name = Arc::clone(&self.name);
        self.execute(
            "unpause",
            true,
            Box::new(move || {
                monitor.set_state(LoopState::Running).map_err(Fault::Action)?;
                debug!(loop_name = %name, "loop unpaused");
                Ok(())
            }),
        )
    }

    /// Clears crashed state and returns the loop to its initial state.
    ///
    /// Submitted as a non-cancellable task, so a crashed main loop runs it.
    pub fn reinitialize(&self) -> Result<()> {
        let monitor = Arc::clone(&self.monitor);
        let queue = Arc::clone(&self.queue);
        let initial = self.initial_state();
        let name = Arc::clone(&self.name);
        self.execute(
            "reinitialize",
            false,
            Box::new(move || {
                queue.reset();
                monitor.set_state(initial).map_err(Fault::Action)?;
                debug!(loop_name = %name, state = %initial, "loop reinitialized");
                Ok(())
            }),
        )
    }

    /// Cancels every pending control task and terminates. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut shared = self.monitor.shared.lock();
            if shared.state == LoopState::Terminated {
                return;
            }
            shared.state = LoopState::Terminated;
            self.cancel_pending(&mut shared);
        }
        self.monitor.signal.notify_all();
        debug!(loop_name = %self.name, "loop controller shut down");
    }

    /// Returns the loop to its initial state between tests.
    ///
    /// Clears the queue, cancels pending control tasks and, for the main loop
    /// in instrumentation test mode, runs a reinitialization.
    pub fn reset(&self) -> Result<()> {
        self.queue.reset();
        {
            let mut shared = self.monitor.shared.lock();
            if shared.state == LoopState::Terminated {
                return Ok(());
            }
            self.cancel_pending(&mut shared);
            shared.state = self.initial_state();
        }
        self.monitor.signal.notify_all();
        debug!(loop_name = %self.name, state = %self.initial_state(), "loop controller reset");
        if self.monitor.role == LoopRole::Main && self.mode == LooperMode::InstrumentationTest {
            self.reinitialize()?;
        }
        Ok(())
    }

    fn cancel_pending(&self, shared: &mut ControlState) {
        for task in shared.pending.drain(..) {
            if task.cancel() {
                self.metrics.control_tasks_cancelled.increment();
            }
            task.unqueue(&self.queue);
        }
    }

    /// Queues pending tasks that were handed to a paused or crashed loop.
    ///
    /// Called under the monitor once the loop is running again. The oldest
    /// task ends up at the head of the queue. Tasks the queue refuses are
    /// cancelled.
    fn resubmit_pending(&self, shared: &mut ControlState) {
        let mut refused = Vec::new();
        for task in shared.pending.iter().rev() {
            if task.is_queued(&self.queue) || !task.is_pending() {
                continue;
            }
            match self
                .queue
                .push(Work::Control(Arc::clone(task)), Placement::Front, true)
            {
                Ok(handle) => task.set_queued(handle),
                Err(_) => refused.push(Arc::clone(task)),
            }
        }
        for task in &refused {
            shared.pending.retain(|t| !Arc::ptr_eq(t, task));
            if task.cancel() {
                self.metrics.control_tasks_cancelled.increment();
            }
        }
        trace!(
            loop_name = %self.name,
            queued = shared.pending.len(),
            refused = refused.len(),
            "pending control tasks resubmitted"
        );
    }

    /// Loop thread: forgets a task that ran from the queue.
    pub(crate) fn retire(&self, task: &Arc<ControlTask>) {
        self.monitor
            .shared
            .lock()
            .pending
            .retain(|t| !Arc::ptr_eq(t, task));
    }

    /// Loop thread: runs control tasks while paused; returns once not paused.
    pub(crate) fn run_paused(&self) -> std::result::Result<(), Uncaught> {
        loop {
            let task = {
                let mut shared = self.monitor.shared.lock();
                loop {
                    if shared.state != LoopState::Paused {
                        if shared.state == LoopState::Running {
                            self.resubmit_pending(&mut shared);
                        }
                        return Ok(());
                    }
                    if let Some(task) = shared.pending.pop_front() {
                        break task;
                    }
                    self.monitor.signal.wait(&mut shared);
                }
            };
            if task.run(&self.queue)? {
                self.metrics.control_tasks_run.increment();
            }
        }
    }

    /// Main loop thread: reacts to a panic that escaped dispatch.
    ///
    /// Marks the loop crashed, fails the control tasks that were running, then
    /// blocks cancelling cancellable tasks and running non-cancellable ones
    /// until one of them moves the loop out of the crashed state.
    pub(crate) fn crashed(&self, uncaught: Uncaught) {
        {
            let mut shared = self.monitor.shared.lock();
            if shared.state != LoopState::Terminated {
                shared.state = LoopState::Crashed;
            }
        }
        error!(loop_name = %self.name, cause = %uncaught.cause, "main loop crashed");
        uncaught.release();

        loop {
            let task = {
                let mut shared = self.monitor.shared.lock();
                loop {
                    if shared.state != LoopState::Crashed {
                        if shared.state == LoopState::Running {
                            self.resubmit_pending(&mut shared);
                        }
                        return;
                    }
                    if let Some(task) = shared.pending.pop_front() {
                        break task;
                    }
                    self.monitor.signal.wait(&mut shared);
                }
            };
            if task.is_cancellable() {
                if task.cancel() {
                    self.metrics.control_tasks_cancelled.increment();
                }
                task.unqueue(&self.queue);
                continue;
            }
            match task.run(&self.queue) {
                Ok(ran) => {
                    if ran {
                        self.metrics.control_tasks_run.increment();
                    }
                }
                Err(nested) => {
                    nested.release();
                }
            }
        }
    }
}

impl fmt::Debug for LoopController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.monitor.shared.lock();
        f.debug_struct("LoopController")
            .field("name", &self.name)
            .field("role", &self.monitor.role)
            .field("mode", &self.mode)
            .field("state", &shared.state)
            .field("pending", &shared.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use crate::time::VirtualClock;
    use crate::types::Time;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn controller(role: LoopRole, mode: LooperMode) -> LoopController {
        let clock = Arc::new(VirtualClock::starting_at(Time::from_millis(100)));
        LoopController::new(
            Arc::from("test"),
            role,
            mode,
            TaskQueue::new(clock),
            Arc::new(LoopMetrics::new()),
        )
    }

    #[test]
    fn initial_state_follows_role_and_mode() {
        init_test("initial_state_follows_role_and_mode");
        assert_eq!(
            controller(LoopRole::Main, LooperMode::Paused).state(),
            LoopState::Paused
        );
        assert_eq!(
            controller(LoopRole::Main, LooperMode::InstrumentationTest).state(),
            LoopState::Running
        );
        assert_eq!(
            controller(LoopRole::Background, LooperMode::Paused).state(),
            LoopState::Running
        );
        crate::test_complete!("initial_state_follows_role_and_mode");
    }

    #[test]
    fn control_task_runs_once() {
        init_test("control_task_runs_once");
        let clock = Arc::new(VirtualClock::new());
        let queue = TaskQueue::new(clock);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = ControlTask::new(
            "count",
            true,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        assert!(task.run(&queue).ok().unwrap());
        assert!(!task.run(&queue).ok().unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(matches!(task.wait(), Completion::Done));
        crate::test_complete!("control_task_runs_once");
    }

    #[test]
    fn cancelled_task_never_runs() {
        init_test("cancelled_task_never_runs");
        let clock = Arc::new(VirtualClock::new());
        let queue = TaskQueue::new(clock);
        let task = ControlTask::new("never", true, Box::new(|| panic!("must not run")));
        assert!(task.cancel());
        assert!(!task.cancel());
        assert!(!task.run(&queue).ok().unwrap());
        assert!(matches!(task.wait(), Completion::Cancelled));
        crate::test_complete!("cancelled_task_never_runs");
    }

    #[test]
    fn shutdown_cancels_pending_and_refuses_more_work() {
        init_test("shutdown_cancels_pending_and_refuses_more_work");
        let ctl = controller(LoopRole::Background, LooperMode::Paused);
        let orphan = ControlTask::marker("orphan");
        ctl.monitor.shared.lock().pending.push_back(Arc::clone(&orphan));
        ctl.shutdown();
        assert!(matches!(orphan.wait(), Completion::Cancelled));
        assert_eq!(ctl.state(), LoopState::Terminated);
        assert_eq!(ctl.pending_count(), 0);
        let err = ctl.run_on_loop(|| {}, true).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalState);
        assert_eq!(ctl.metrics.control_tasks_cancelled.value(), 1);
        crate::test_complete!("shutdown_cancels_pending_and_refuses_more_work");
    }

    #[test]
    fn main_loop_unpause_needs_instrumentation_mode() {
        init_test("main_loop_unpause_needs_instrumentation_mode");
        let ctl = controller(LoopRole::Main, LooperMode::Paused);
        let err = ctl.unpause().unwrap_err();
        assert!(err.to_string().contains("instrumentation"), "{err}");
        crate::test_complete!("main_loop_unpause_needs_instrumentation_mode");
    }

    #[test]
    fn unpausing_a_running_loop_is_illegal() {
        init_test("unpausing_a_running_loop_is_illegal");
        let ctl = controller(LoopRole::Background, LooperMode::Paused);
        let err = ctl.unpause().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalState);
        crate::test_complete!("unpausing_a_running_loop_is_illegal");
    }

    #[test]
    fn leaving_the_pause_wait_queues_what_is_still_pending() {
        init_test("leaving_the_pause_wait_queues_what_is_still_pending");
        let ctl = controller(LoopRole::Background, LooperMode::Paused);
        let order = Arc::new(Mutex::new(Vec::new()));
        let make = |name: &'static str| {
            let out = Arc::clone(&order);
            ControlTask::new(
                name,
                true,
                Box::new(move || {
                    out.lock().push(name);
                    Ok(())
                }),
            )
        };
        let (first, second) = (make("first"), make("second"));
        {
            let mut shared = ctl.monitor.shared.lock();
            shared.state = LoopState::Paused;
            shared.pending.push_back(Arc::clone(&first));
            shared.pending.push_back(Arc::clone(&second));
        }
        ctl.monitor.set_state(LoopState::Running).unwrap();

        assert!(ctl.run_paused().is_ok());
        assert_eq!(ctl.queue.len(), 2);
        assert_eq!(ctl.pending_count(), 2);
        while let Some(task) = ctl.queue.take_due() {
            let control = Arc::clone(task.work.control_task().unwrap());
            assert!(control.run(&ctl.queue).ok().unwrap());
            ctl.retire(&control);
        }
        assert_eq!(*order.lock(), ["first", "second"]);
        assert_eq!(ctl.pending_count(), 0);
        assert!(matches!(second.wait(), Completion::Done));
        crate::test_complete!("leaving_the_pause_wait_queues_what_is_still_pending");
    }

    #[test]
    fn leaving_the_pause_wait_cancels_what_the_queue_refuses() {
        init_test("leaving_the_pause_wait_cancels_what_the_queue_refuses");
        let ctl = controller(LoopRole::Background, LooperMode::Paused);
        let stranded = ControlTask::new("stranded", true, Box::new(|| Ok(())));
        {
            let mut shared = ctl.monitor.shared.lock();
            shared.state = LoopState::Paused;
            shared.pending.push_back(Arc::clone(&stranded));
        }
        ctl.queue.quit(true);
        ctl.monitor.set_state(LoopState::Running).unwrap();

        assert!(ctl.run_paused().is_ok());
        assert!(matches!(stranded.wait(), Completion::Cancelled));
        assert_eq!(ctl.pending_count(), 0);
        assert_eq!(ctl.metrics.control_tasks_cancelled.value(), 1);
        crate::test_complete!("leaving_the_pause_wait_cancels_what_the_queue_refuses");
    }

    #[test]
    fn uncaught_release_fails_deferred_tasks() {
        init_test("uncaught_release_fails_deferred_tasks");
        let task = ControlTask::marker("victim");
        let mut uncaught = Uncaught::new(Arc::new(PanicPayload::new("boom")));
        uncaught.deferred.push(Arc::clone(&task));
        let err = uncaught.release();
        assert_eq!(err.kind(), crate::error::ErrorKind::Panicked);
        assert!(matches!(task.wait(), Completion::Failed(Error::Panicked(_))));
        crate::test_complete!("uncaught_release_fails_deferred_tasks");
    }
}
