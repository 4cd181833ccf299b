//! Error types.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants map
//! one-to-one onto the failure classes a test driver has to tell apart:
//! misuse for the current state, bad arguments, a dead loop thread, a control
//! task cancelled underneath its caller, and a panic raised by scheduled work.

use crate::types::PanicPayload;
use std::sync::Arc;
use thiserror::Error;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation not valid in the current state.
    IllegalState,
    /// Argument out of range (for example moving the clock backwards).
    InvalidArgument,
    /// A background loop thread died from a panic.
    LoopThreadDied,
    /// A control task was cancelled by shutdown, reset or crash draining.
    Cancelled,
    /// Scheduled work panicked.
    Panicked,
    /// The OS refused to start a loop thread.
    Spawn,
}

/// Errors produced by clocks, queues, loops and their controllers.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Operation not valid in the current state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Argument out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The loop's thread terminated because of an uncaught panic.
    ///
    /// Raised by every later operation on that loop until it is reset.
    #[error("loop thread has died due to an uncaught panic: {0}")]
    LoopThreadDied(#[source] Arc<PanicPayload>),

    /// A control task was cancelled before it ran.
    #[error("control task was cancelled")]
    Cancelled,

    /// Work panicked and the panic did not carry a crate [`Error`].
    #[error("task panicked: {0}")]
    Panicked(Arc<PanicPayload>),

    /// A loop thread could not be spawned.
    #[error("failed to spawn loop thread `{name}`: {reason}")]
    Spawn {
        /// Requested thread name.
        name: String,
        /// OS error text.
        reason: String,
    },
}

impl Error {
    /// Builds an [`Error::IllegalState`].
    #[must_use]
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Builds an [`Error::InvalidArgument`].
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Returns the coarse error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::IllegalState(_) => ErrorKind::IllegalState,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::LoopThreadDied(_) => ErrorKind::LoopThreadDied,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Panicked(_) => ErrorKind::Panicked,
            Self::Spawn { .. } => ErrorKind::Spawn,
        }
    }

    /// Returns `true` for [`ErrorKind::Cancelled`].
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The panic behind a [`LoopThreadDied`](Self::LoopThreadDied) or
    /// [`Panicked`](Self::Panicked) error.
    #[must_use]
    pub fn panic_payload(&self) -> Option<&Arc<PanicPayload>> {
        match self {
            Self::LoopThreadDied(payload) | Self::Panicked(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
