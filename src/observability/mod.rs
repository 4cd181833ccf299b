//! Loop activity counters.
//!
//! Logging goes through [`tracing_compat`](crate::tracing_compat); this module
//! only holds the numbers tests assert on.

pub mod metrics;

pub use metrics::{Counter, LoopMetrics, LoopMetricsSnapshot};
