//! Virtual time.
//!
//! [`VirtualClock`] is the one piece of state every loop in a
//! [`LooperRegistry`](crate::looper::LooperRegistry) shares. Queues and frame
//! clocks subscribe to it as [`ClockListener`]s to learn when work becomes due.

mod clock;

pub use clock::{ClockListener, ListenerId, TimeSource, VirtualClock};
