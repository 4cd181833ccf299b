//! Simulated display vsync.
//!
//! A [`FrameClock`] turns virtual time into frame ticks for one loop. A
//! requested frame is delivered by posting an asynchronous task carrying a
//! [`FrameTick`] to the owning loop, so frames pass synchronization barriers
//! the same way the platform's vsync messages do.
//!
//! Delivery follows [`FrameDelivery`]:
//!
//! - immediate: the clock is advanced by one frame interval and the tick is
//!   posted at the new time right away;
//! - deferred: only the next vsync time is recorded; the tick is posted once
//!   some later clock advance crosses it;
//! - auto: deferred while the owning loop is paused, immediate otherwise.

use crate::config::{FrameDelivery, FrameTiming, LooperConfig};
use crate::error::Result;
use crate::looper::Looper;
use crate::time::{ClockListener, ListenerId};
use crate::tracing_compat::{trace, warn};
use crate::types::Time;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Per-frame timing metadata, present with [`FrameTiming::Timeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTimeline {
    /// Identifier of the vsync this frame belongs to.
    pub vsync_id: u64,
    /// When the frame is expected on screen.
    pub expected_present_time: Time,
    /// Deadline for the frame's work.
    pub deadline: Time,
    /// Frame interval in effect.
    pub frame_interval: Duration,
}

/// One delivered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTick {
    /// Frame counter, starting at 1 and increasing by one per frame.
    pub frame: u64,
    /// Vsync time of the frame.
    pub timestamp: Time,
    /// Timing metadata, if the configuration supports it.
    pub timeline: Option<FrameTimeline>,
}

/// Receives frame ticks on the owning loop's thread.
pub trait FrameCallback: Send + Sync {
    /// Called once per frame.
    fn on_frame(&self, tick: FrameTick);
}

impl<F> FrameCallback for F
where
    F: Fn(FrameTick) + Send + Sync,
{
    fn on_frame(&self, tick: FrameTick) {
        self(tick);
    }
}

#[derive(Debug, Default)]
struct FrameState {
    next_vsync: Option<Time>,
    frame_counter: u64,
}

struct FrameInner {
    looper: Looper,
    callback: Arc<dyn FrameCallback>,
    interval: Duration,
    delivery: FrameDelivery,
    timing: FrameTiming,
    state: Mutex<FrameState>,
}

impl FrameInner {
    /// Posts the next tick. The counter only moves once the loop accepted it.
    fn deliver(&self, timestamp: Time) -> Result<()> {
        let mut state = self.state.lock();
        let frame = state.frame_counter + 1;
        let timeline = (self.timing == FrameTiming::Timeline).then(|| {
            let present = timestamp + self.interval;
            FrameTimeline {
                vsync_id: frame,
                expected_present_time: present,
                deadline: present,
                frame_interval: self.interval,
            }
        });
        let tick = FrameTick {
            frame,
            timestamp,
            timeline,
        };
        let callback = Arc::clone(&self.callback);
        self.looper
            .queue()
            .enqueue_async(move || callback.on_frame(tick), timestamp)?;
        state.frame_counter = frame;
        drop(state);
        trace!(loop_name = %self.looper.name(), frame, at = %timestamp, "frame posted");
        Ok(())
    }

    fn on_clock_advanced(&self, now: Time) {
        let due = {
            let mut state = self.state.lock();
            match state.next_vsync {
                Some(vsync) if vsync <= now => state.next_vsync.take(),
                _ => None,
            }
        };
        if let Some(vsync) = due {
            if let Err(err) = self.deliver(vsync) {
                warn!(loop_name = %self.looper.name(), error = %err, "dropping frame tick");
            }
        }
    }
}

struct VsyncListener {
    inner: Weak<FrameInner>,
}

impl ClockListener for VsyncListener {
    fn on_advance(&self, now: Time) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_clock_advanced(now);
        }
    }
}

/// Vsync source for one loop.
pub struct FrameClock {
    inner: Arc<FrameInner>,
    listener: Mutex<Option<ListenerId>>,
}

impl FrameClock {
    /// Creates a frame clock delivering to `callback` on `looper`.
    pub fn new<C>(looper: &Looper, config: &LooperConfig, callback: C) -> Self
    where
        C: FrameCallback + 'static,
    {
        let inner = Arc::new(FrameInner {
            looper: looper.clone(),
            callback: Arc::new(callback),
            interval: config.frame_interval(),
            delivery: config.frame_delivery,
            timing: config.frame_timing,
            state: Mutex::new(FrameState::default()),
        });
        let listener = looper.clock().add_listener(Arc::new(VsyncListener {
            inner: Arc::downgrade(&inner),
        }));
        Self {
            inner,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Asks for the next frame.
    ///
    /// Deferred delivery only records the next vsync, and only if none is
    /// pending. Immediate delivery advances the clock one interval and posts
    /// the tick at once.
    ///
    /// # Errors
    ///
    /// Whatever the owning loop's queue returns when the tick is posted.
    pub fn request_frame_callback(&self) -> Result<()> {
        let inner = &self.inner;
        let deferred = match inner.delivery {
            FrameDelivery::Deferred => true,
            FrameDelivery::Immediate => false,
            FrameDelivery::Auto => inner.looper.is_paused(),
        };
        let clock = inner.looper.clock();
        if deferred {
            let mut state = inner.state.lock();
            if state.next_vsync.is_none() {
                state.next_vsync = Some(clock.now() + inner.interval);
            }
            return Ok(());
        }
        let vsync = clock.advance_by(inner.interval);
        inner.deliver(vsync)
    }

    /// Time of the pending vsync, if a frame was requested and not yet delivered.
    #[must_use]
    pub fn pending_vsync(&self) -> Option<Time> {
        self.inner.state.lock().next_vsync
    }

    /// Frames delivered since creation or the last reset.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.inner.state.lock().frame_counter
    }

    /// Time between frames.
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        self.inner.interval
    }

    /// Forgets the pending vsync and restarts the frame counter.
    pub fn reset_state(&self) {
        *self.inner.state.lock() = FrameState::default();
    }
}

impl Drop for FrameClock {
    fn drop(&mut self) {
        if let Some(id) = self.listener.get_mut().take() {
            self.inner.looper.clock().remove_listener(id);
        }
    }
}

impl fmt::Debug for FrameClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FrameClock")
            .field("looper", &self.inner.looper.name())
            .field("interval", &self.inner.interval)
            .field("delivery", &self.inner.delivery)
            .field("next_vsync", &state.next_vsync)
            .field("frame_counter", &state.frame_counter)
            .finish_non_exhaustive()
    }
}
