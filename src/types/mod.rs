//! Core types shared by every part of the crate.
//!
//! - [`id`]: identifiers (`LoopId`, `QueueId`, `BarrierToken`, `IdleCallbackId`) and [`Time`]
//! - [`panic`]: captured panics from loop threads

pub mod id;
pub mod panic;

pub use id::{BarrierToken, IdleCallbackId, LoopId, QueueId, Time};
pub use panic::PanicPayload;
