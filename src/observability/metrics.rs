//! Per-loop counters.
//!
//! Every loop owns one [`LoopMetrics`]. Counters are atomics so the loop
//! thread can bump them while a test thread reads a snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing, shareable counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Creates a counter at zero.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Returns the counter name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the current value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Adds one.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Resets to zero.
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Activity counters for one loop.
#[derive(Debug)]
pub struct LoopMetrics {
    /// Posted tasks dispatched (controller tasks excluded).
    pub tasks_dispatched: Counter,
    /// Idle callback invocations.
    pub idle_callbacks_fired: Counter,
    /// Controller tasks that actually ran.
    pub control_tasks_run: Counter,
    /// Controller tasks cancelled before running.
    pub control_tasks_cancelled: Counter,
    /// Panics that escaped dispatch.
    pub uncaught_panics: Counter,
}

impl LoopMetrics {
    /// All counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tasks_dispatched: Counter::new("tasks_dispatched"),
            idle_callbacks_fired: Counter::new("idle_callbacks_fired"),
            control_tasks_run: Counter::new("control_tasks_run"),
            control_tasks_cancelled: Counter::new("control_tasks_cancelled"),
            uncaught_panics: Counter::new("uncaught_panics"),
        }
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> LoopMetricsSnapshot {
        LoopMetricsSnapshot {
            tasks_dispatched: self.tasks_dispatched.value(),
            idle_callbacks_fired: self.idle_callbacks_fired.value(),
            control_tasks_run: self.control_tasks_run.value(),
            control_tasks_cancelled: self.control_tasks_cancelled.value(),
            uncaught_panics: self.uncaught_panics.value(),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.reset();
        }
    }

    /// The counters in declaration order.
    #[must_use]
    pub fn counters(&self) -> [&Counter; 5] {
        [
            &self.tasks_dispatched,
            &self.idle_callbacks_fired,
            &self.control_tasks_run,
            &self.control_tasks_cancelled,
            &self.uncaught_panics,
        ]
    }
}

impl Default for LoopMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable copy of [`LoopMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopMetricsSnapshot {
    /// Posted tasks dispatched.
    pub tasks_dispatched: u64,
    /// Idle callback invocations.
    pub idle_callbacks_fired: u64,
    /// Controller tasks run.
    pub control_tasks_run: u64,
    /// Controller tasks cancelled.
    pub control_tasks_cancelled: u64,
    /// Panics that escaped dispatch.
    pub uncaught_panics: u64,
}
