//! The set of loops sharing one virtual clock.
//!
//! A [`LooperRegistry`] is the test harness's context object: it owns the
//! clock, the main loop, every background loop it spawned and weak references
//! to the frame clocks created through it. [`reset`](LooperRegistry::reset)
//! returns all of them to their initial state between tests; dropping the
//! registry terminates and joins every loop thread.

use crate::config::LooperConfig;
use crate::error::Result;
use crate::frame::{FrameCallback, FrameClock};
use crate::looper::event_loop::Looper;
use crate::looper::state::{LoopRole, LoopState};
use crate::time::VirtualClock;
use crate::tracing_compat::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// Owner of the clock and every loop that runs against it.
pub struct LooperRegistry {
    config: LooperConfig,
    clock: Arc<VirtualClock>,
    main: Looper,
    loopers: Mutex<Vec<Looper>>,
    frame_clocks: Mutex<Vec<Weak<FrameClock>>>,
}

impl LooperRegistry {
    /// Starts the clock at the configured uptime and spawns the main loop.
    ///
    /// # Errors
    ///
    /// [`Error::Spawn`](crate::Error::Spawn) if the main loop thread cannot start.
    pub fn new(config: LooperConfig) -> Result<Self> {
        let clock = Arc::new(VirtualClock::starting_at(config.initial_uptime()));
        let main = Looper::spawn(
            &config.main_thread_name,
            LoopRole::Main,
            config.mode,
            Arc::clone(&clock),
        )?;
        info!(mode = ?config.mode, main = %main.name(), "looper registry started");
        Ok(Self {
            config,
            clock,
            main,
            loopers: Mutex::new(Vec::new()),
            frame_clocks: Mutex::new(Vec::new()),
        })
    }

    /// The configuration the registry was built with.
    #[must_use]
    pub fn config(&self) -> &LooperConfig {
        &self.config
    }

    /// The shared virtual clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<VirtualClock> {
        &self.clock
    }

    /// The main loop.
    #[must_use]
    pub fn main_looper(&self) -> &Looper {
        &self.main
    }

    /// Starts a running background loop on a new thread named `name`.
    pub fn spawn_looper(&self, name: &str) -> Result<Looper> {
        let looper = Looper::spawn(
            name,
            LoopRole::Background,
            self.config.mode,
            Arc::clone(&self.clock),
        )?;
        self.loopers.lock().push(looper.clone());
        debug!(loop_name = %name, id = %looper.id(), "background loop spawned");
        Ok(looper)
    }

    /// Every live loop, main loop first.
    #[must_use]
    pub fn loopers(&self) -> Vec<Looper> {
        let mut all = vec![self.main.clone()];
        all.extend(self.loopers.lock().iter().cloned());
        all
    }

    /// Creates a frame clock for `looper` using the registry's frame settings.
    ///
    /// The registry keeps a weak reference so [`reset`](Self::reset) can clear it.
    pub fn frame_clock<C>(&self, looper: &Looper, callback: C) -> Arc<FrameClock>
    where
        C: FrameCallback + 'static,
    {
        let frames = Arc::new(FrameClock::new(looper, &self.config, callback));
        let mut clocks = self.frame_clocks.lock();
        clocks.retain(|weak| weak.strong_count() > 0);
        clocks.push(Arc::downgrade(&frames));
        frames
    }

    /// Returns every loop, frame clock and the clock to their initial state.
    ///
    /// Background loops that have terminated are joined and forgotten. All
    /// loops are reset even if one of them fails; the first error is returned.
    pub fn reset(&self) -> Result<()> {
        let mut first_error = None;
        for looper in self.loopers() {
            if let Err(err) = looper.reset_to_initial_state() {
                warn!(loop_name = %looper.name(), error = %err, "loop reset failed");
                first_error.get_or_insert(err);
            }
        }

        let dead: Vec<Looper> = {
            let mut loopers = self.loopers.lock();
            let (dead, live) = loopers
                .drain(..)
                .partition(|l| l.state() == LoopState::Terminated);
            *loopers = live;
            dead
        };
        for looper in &dead {
            looper.join()?;
        }

        let frames: Vec<Arc<FrameClock>> = {
            let mut clocks = self.frame_clocks.lock();
            clocks.retain(|weak| weak.strong_count() > 0);
            clocks.iter().filter_map(Weak::upgrade).collect()
        };
        for frame_clock in &frames {
            frame_clock.reset_state();
        }

        self.clock.reset(self.config.initial_uptime());
        debug!(
            dropped_loops = dead.len(),
            frame_clocks = frames.len(),
            "looper registry reset"
        );
        first_error.map_or(Ok(()), Err)
    }

    /// Terminates every loop and waits for the threads to exit.
    pub fn shutdown(&self) {
        let background: Vec<Looper> = self.loopers.lock().drain(..).collect();
        for looper in background.iter().chain(std::iter::once(&self.main)) {
            looper.terminate();
        }
        for looper in background.iter().chain(std::iter::once(&self.main)) {
            if let Err(err) = looper.join() {
                warn!(loop_name = %looper.name(), error = %err, "loop join failed");
            }
        }
        debug!("looper registry shut down");
    }
}

impl Drop for LooperRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for LooperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LooperRegistry")
            .field("mode", &self.config.mode)
            .field("now", &self.clock.now())
            .field("main", &self.main)
            .field("background", &self.loopers.lock().len())
            .finish_non_exhaustive()
    }
}
