//! Scheduled tasks and their ordering.
//!
//! A task is keyed by `(lane, when, seq)`. Front-of-queue inserts live in
//! their own lane which always sorts first and is always due; within it the
//! newest insert wins. Timed tasks sort by target time, then by a monotonic
//! sequence number so equal-time tasks keep submission order.

use crate::looper::control::ControlTask;
use crate::types::{QueueId, Time};
use core::cmp::Ordering;
use core::fmt;
use std::sync::Arc;

/// A closure posted to a loop.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Lane {
    Front,
    Timed,
}

/// Position of a task inside its queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TaskKey {
    pub(crate) lane: Lane,
    pub(crate) when: Time,
    pub(crate) seq: u64,
}

impl Ord for TaskKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lane.cmp(&other.lane).then_with(|| match self.lane {
            // Newest front insert first.
            Lane::Front => other.seq.cmp(&self.seq),
            Lane::Timed => self
                .when
                .cmp(&other.when)
                .then_with(|| self.seq.cmp(&other.seq)),
        })
    }
}

impl PartialOrd for TaskKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Handle to a task still sitting in a queue, used to remove it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub(crate) queue: QueueId,
    pub(crate) key: TaskKey,
}

impl TaskHandle {
    /// The time the task was scheduled for.
    #[must_use]
    pub fn target_time(&self) -> Time {
        self.key.when
    }
}

/// What a task does when dispatched.
pub(crate) enum Work {
    /// Ordinary posted work.
    Action(Action),
    /// A controller-submitted task; it also sits in the controller's pending set.
    Control(Arc<ControlTask>),
    /// Transition the loop to paused, then resolve the waiting caller.
    Pause(Arc<ControlTask>),
}

impl Work {
    pub(crate) fn control_task(&self) -> Option<&Arc<ControlTask>> {
        match self {
            Self::Control(task) | Self::Pause(task) => Some(task),
            Self::Action(_) => None,
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action(_) => f.write_str("Action(..)"),
            Self::Control(task) => f.debug_tuple("Control").field(&task.label()).finish(),
            Self::Pause(_) => f.write_str("Pause"),
        }
    }
}

/// A task taken out of a [`TaskQueue`](crate::looper::TaskQueue).
///
/// Once taken it is no longer in the queue, so it can be dispatched at most once.
pub struct ScheduledTask {
    pub(crate) key: TaskKey,
    pub(crate) asynchronous: bool,
    pub(crate) work: Work,
}

impl ScheduledTask {
    /// Target time on the virtual clock.
    #[must_use]
    pub fn target_time(&self) -> Time {
        self.key.when
    }

    /// Whether the task bypasses synchronization barriers.
    #[must_use]
    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    /// Whether the task was submitted by a [`LoopController`](crate::looper::LoopController).
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.work.control_task().is_some()
    }

    /// Runs the task on the current thread.
    ///
    /// Posted actions run directly and any panic propagates to the caller.
    /// Controller tasks can only be run by their own loop; outside it they
    /// are cancelled so the submitting thread is released.
    pub fn run(self) {
        match self.work {
            Work::Action(action) => action(),
            Work::Control(task) | Work::Pause(task) => {
                task.cancel();
            }
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("when", &self.key.when)
            .field("seq", &self.key.seq)
            .field("front", &(self.key.lane == Lane::Front))
            .field("asynchronous", &self.asynchronous)
            .field("work", &self.work)
            .finish()
    }
}
