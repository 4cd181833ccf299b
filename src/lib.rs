//! Looperlab: deterministic single-threaded event loops for tests.
//!
//! # Overview
//!
//! Looperlab simulates a platform event-loop stack (loops, message queues,
//! handlers and vsync) inside a test process. Every loop runs on its own OS
//! thread, but all of them order their work against one shared
//! [`VirtualClock`], and a test driver thread decides when time moves and
//! when queued work runs.
//!
//! # Core Guarantees
//!
//! - **Deterministic ordering**: tasks run by target time, FIFO at equal time
//! - **Time only moves when told**: nothing is due until the virtual clock says so
//! - **No lost control work**: every control task either runs or is cancelled;
//!   a waiting caller is never left hanging
//! - **Loud failures**: a panic in dispatched work crashes the main loop or
//!   kills a background loop, and every later interaction reports it
//!
//! # Module Structure
//!
//! - [`time`]: the virtual clock and its listener seam
//! - [`looper`]: task queues, loops, controllers and the registry
//! - [`frame`]: simulated vsync delivery
//! - [`config`]: registry configuration from code, environment or TOML
//! - [`observability`]: per-loop counters
//! - [`error`](mod@error): error types
//! - [`types`]: identifiers, [`Time`] and captured panics
//! - [`tracing_compat`]: optional tracing integration (requires `tracing-integration` feature)
//!
//! # Example
//!
//! ```no_run
//! use looperlab::{LooperConfig, LooperRegistry};
//! use std::time::Duration;
//!
//! let registry = LooperRegistry::new(LooperConfig::default())?;
//! let main = registry.main_looper();
//! main.post_delayed(|| println!("ran"), Duration::from_millis(10))?;
//! main.idle_for(Duration::from_millis(10))?;
//! # Ok::<(), looperlab::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod error;
pub mod frame;
pub mod looper;
pub mod observability;
pub mod time;
pub mod tracing_compat;
pub mod types;

#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

// Re-exports for convenient access to core types
pub use config::{ConfigError, FrameDelivery, FrameTiming, LooperConfig, LooperMode};
pub use error::{Error, ErrorKind, Result};
pub use frame::{FrameCallback, FrameClock, FrameTick, FrameTimeline};
pub use looper::{
    IdleCallback, IdleDecision, LoopController, LoopRole, LoopState, Looper, LooperRegistry,
    LooperSnapshot, ScheduledTask, TaskHandle, TaskQueue,
};
pub use observability::{LoopMetrics, LoopMetricsSnapshot};
pub use time::{ClockListener, TimeSource, VirtualClock};
pub use types::{BarrierToken, IdleCallbackId, LoopId, PanicPayload, Time};
