//! Identifier and timestamp types.
//!
//! Loops, queues, barriers and idle callbacks are named by small copyable
//! newtypes so that a token handed out by one queue can never be confused with
//! an index of another kind. [`Time`] is the virtual uptime every queue orders
//! its tasks by.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::ops::Add;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

static NEXT_LOOP_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one event loop for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoopId(u32);

impl LoopId {
    /// Allocates a fresh, never reused loop id.
    #[must_use]
    pub(crate) fn next() -> Self {
        Self(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoopId({})", self.0)
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Identifies a task queue; stamped into every [`TaskHandle`](crate::looper::TaskHandle).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

impl QueueId {
    #[must_use]
    pub(crate) fn next() -> Self {
        Self(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", self.0)
    }
}

/// Token returned by [`TaskQueue::insert_barrier`](crate::looper::TaskQueue::insert_barrier).
///
/// Tokens start at zero after every queue reset and count upward.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarrierToken(u32);

impl BarrierToken {
    #[inline]
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw token value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for BarrierToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BarrierToken({})", self.0)
    }
}

/// Registration handle for an idle callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdleCallbackId(u64);

impl IdleCallbackId {
    #[inline]
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// A point on the virtual uptime axis, in nanoseconds.
///
/// `Time::ZERO` doubles as "nothing scheduled" in the introspection API,
/// matching the platform convention of returning 0 for an empty queue.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Time(u64);

impl Time {
    /// The zero instant.
    pub const ZERO: Self = Self(0);

    /// The maximum representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a time from nanoseconds of uptime.
    #[inline]
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a time from milliseconds of uptime.
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Creates a time from a duration since zero, saturating at [`Time::MAX`].
    #[inline]
    #[must_use]
    pub fn from_duration(since_zero: Duration) -> Self {
        Self::ZERO + since_zero
    }

    /// Returns the time as nanoseconds of uptime.
    #[inline]
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the time as milliseconds of uptime (truncated).
    #[inline]
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Returns `true` for [`Time::ZERO`].
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Elapsed time from `earlier` to `self`, or zero if `earlier` is later.
    #[inline]
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        let nanos = u64::try_from(rhs.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(nanos))
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0 / 1_000_000;
        let sub = self.0 % 1_000_000;
        if sub == 0 {
            write!(f, "{millis}ms")
        } else {
            write!(f, "{millis}.{sub:06}ms")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_unit_conversions() {
        assert_eq!(Time::from_millis(1).as_nanos(), 1_000_000);
        assert_eq!(Time::from_nanos(1_500_000).as_millis(), 1);
        assert_eq!(Time::from_duration(Duration::from_millis(250)), Time::from_millis(250));
        assert!(Time::ZERO.is_zero());
    }

    #[test]
    fn time_addition_saturates() {
        assert_eq!(Time::MAX + Duration::from_secs(1), Time::MAX);
        assert_eq!(
            Time::from_millis(100) + Duration::from_millis(16),
            Time::from_millis(116)
        );
    }

    #[test]
    fn duration_since_never_negative() {
        let early = Time::from_millis(100);
        let late = Time::from_millis(150);
        assert_eq!(late.saturating_duration_since(early), Duration::from_millis(50));
        assert_eq!(early.saturating_duration_since(late), Duration::ZERO);
    }

    #[test]
    fn time_display_uses_millis() {
        assert_eq!(Time::from_millis(100).to_string(), "100ms");
        assert_eq!(Time::from_nanos(1_500_000).to_string(), "1.500000ms");
    }

    #[test]
    fn loop_ids_are_unique() {
        let a = LoopId::next();
        let b = LoopId::next();
        assert_ne!(a, b);
        assert_eq!(format!("{a}"), format!("L{}", a.get()));
    }

    #[test]
    fn barrier_token_debug_format() {
        let token = BarrierToken::new(7);
        assert_eq!(format!("{token:?}"), "BarrierToken(7)");
        assert_eq!(token.get(), 7);
    }
}
