//! Captured panics.
//!
//! A panic escaping work on a loop thread is the analogue of an uncaught
//! exception. It is caught at the dispatch boundary and kept as a
//! [`PanicPayload`] so it can be re-raised on whichever thread asks about it.

use crate::error::Error;
use core::fmt;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// The message (and, if the panic carried one, the crate [`Error`]) of a caught panic.
#[derive(Debug, Clone)]
pub struct PanicPayload {
    message: String,
    error: Option<Error>,
}

impl PanicPayload {
    /// Creates a payload from a plain message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: None,
        }
    }

    /// Converts the value produced by `catch_unwind`.
    ///
    /// Payloads raised with `std::panic::panic_any(error)` keep their [`Error`].
    #[must_use]
    pub fn from_unwind(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<Error>() {
            Ok(error) => {
                return Self {
                    message: error.to_string(),
                    error: Some(*error),
                };
            }
            Err(other) => other,
        };
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(other) => other
                .downcast_ref::<&'static str>()
                .map_or_else(|| "Box<dyn Any>".to_owned(), |s| (*s).to_owned()),
        };
        Self::new(message)
    }

    /// The panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The crate error the panic was raised with, if any.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// The error handed to a caller that was waiting on the panicking work.
    ///
    /// An [`Error`] payload comes back unchanged; anything else is wrapped in
    /// [`Error::Panicked`].
    #[must_use]
    pub fn to_error(self: &Arc<Self>) -> Error {
        self.error
            .clone()
            .unwrap_or_else(|| Error::Panicked(Arc::clone(self)))
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PanicPayload {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Runs `f`, turning an unwinding panic into a shared [`PanicPayload`].
pub(crate) fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, Arc<PanicPayload>> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Arc::new(PanicPayload::from_unwind(payload)))
}
