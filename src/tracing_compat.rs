//! Optional tracing integration.
//!
//! With the `tracing-integration` feature enabled this module re-exports the
//! `tracing` event macros. Without it the same names expand to nothing, so
//! call sites never need their own `cfg` guards:
//!
//! ```ignore
//! use crate::tracing_compat::{debug, warn};
//!
//! debug!(loop_name = %name, "loop paused");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    macro_rules! trace {
        ($($arg:tt)*) => {{}};
    }
    macro_rules! debug {
        ($($arg:tt)*) => {{}};
    }
    macro_rules! info {
        ($($arg:tt)*) => {{}};
    }
    macro_rules! warn {
        ($($arg:tt)*) => {{}};
    }
    macro_rules! error {
        ($($arg:tt)*) => {{}};
    }

    pub(crate) use {debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub(crate) use noop::{debug, error, info, trace, warn};
