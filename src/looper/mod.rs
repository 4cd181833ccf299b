//! Event loops, their task queues and cross-thread control.
//!
//! - [`TaskQueue`]: time-ordered tasks, barriers and idle callbacks
//! - [`Looper`]: one queue drained by one OS thread
//! - [`LoopController`]: serialized control of a loop from other threads
//! - [`LooperRegistry`]: the clock plus every loop that runs against it

pub(crate) mod control;
mod event_loop;
pub(crate) mod queue;
mod registry;
pub mod state;
mod task;

pub use control::LoopController;
pub use event_loop::{Looper, LooperSnapshot};
pub use queue::{IdleCallback, IdleDecision, TaskQueue};
pub use registry::LooperRegistry;
pub use state::{LoopRole, LoopState, LoopTransitionError};
pub use task::{Action, ScheduledTask, TaskHandle};
