//! Shared helpers for unit and integration tests.
//!
//! Tests call [`init_test_logging`] first, then bracket their body with
//! [`test_phase!`](crate::test_phase) and [`test_complete!`](crate::test_complete)
//! so the captured log reads as a sequence of named phases. Assertions that
//! should leave a trace use [`assert_with_log!`](crate::assert_with_log).
//!
//! Set `RUST_LOG=looperlab=trace` to see loop transitions while a test runs.

use std::sync::Once;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[doc(hidden)]
pub use tracing;

static INIT_LOGGING: Once = Once::new();

/// Installs a test-writer `tracing` subscriber once per process.
///
/// The filter comes from `RUST_LOG`, defaulting to `looperlab=debug`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("looperlab=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .try_init();
    });
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Only for observing work that a running loop performs on its own thread;
/// paused loops are driven synchronously and never need this.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Logs the start of a named test phase.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::test_utils::tracing::info!(phase = %$name, "==== test phase ====");
    };
}

/// Logs successful completion of a test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::test_utils::tracing::info!(test = %$name, "==== test complete ====");
    };
}

/// Asserts `cond`, logging the expected and actual values either way.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {{
        let passed = $cond;
        $crate::test_utils::tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            passed,
            "{}",
            $msg
        );
        assert!(
            passed,
            "{}: expected {:?}, actual {:?}",
            $msg, $expected, $actual
        );
    }};
}
