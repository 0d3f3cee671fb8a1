//! Frame calculator implementations

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use tandem_core::Timestep;

use crate::{Frame, FrameCalculator, FrameTiming};

/// Wall-clock frame calculator
///
/// `delayed` is the number of whole frames elapsed since the last rebase,
/// offset by the rebase timestep. It never moves backwards on its own.
pub struct StandardFrameCalculator {
    /// Instant of the last rebase
    reference: Instant,
    /// Delayed timestep at `reference`
    base: Timestep,
    timing: FrameTiming,
}

impl StandardFrameCalculator {
    pub fn new(timing: FrameTiming) -> Self {
        StandardFrameCalculator {
            reference: Instant::now(),
            base: 0,
            timing,
        }
    }

    fn elapsed_frames(&self) -> Timestep {
        let ms = self.reference.elapsed().as_millis();
        let frames = ms / self.timing.ms_per_frame.max(1) as u128;
        frames.min(i32::MAX as u128) as Timestep
    }
}

impl Default for StandardFrameCalculator {
    fn default() -> Self {
        Self::new(FrameTiming::default())
    }
}

impl FrameCalculator for StandardFrameCalculator {
    fn frame(&self) -> Frame {
        let delayed = self.base.saturating_add(self.elapsed_frames());
        let current = delayed.saturating_add(self.timing.input_delay as Timestep);
        Frame { current, delayed }
    }

    fn set(&mut self, timestep: Timestep) {
        debug!(timestep, "frame calculator rebased");
        self.reference = Instant::now();
        self.base = timestep;
    }

    fn timing(&self) -> FrameTiming {
        self.timing
    }

    fn set_timing(&mut self, timing: FrameTiming) {
        let delayed = self.frame().delayed;
        self.timing = timing;
        self.set(delayed);
    }
}

#[derive(Debug)]
struct ManualClock {
    delayed: Timestep,
    timing: FrameTiming,
}

/// Frame calculator driven by hand
///
/// Clones share one clock, so a test can keep a handle while the
/// synchronizer owns another.
#[derive(Clone, Debug)]
pub struct ManualFrameCalculator {
    clock: Arc<Mutex<ManualClock>>,
}

impl ManualFrameCalculator {
    pub fn new(timing: FrameTiming) -> Self {
        ManualFrameCalculator {
            clock: Arc::new(Mutex::new(ManualClock { delayed: 0, timing })),
        }
    }

    /// Move forward `frames` timesteps
    pub fn advance(&self, frames: i32) {
        let mut clock = self.clock.lock();
        clock.delayed = clock.delayed.saturating_add(frames);
    }

    /// Jump to `timestep` without going through the owner
    pub fn jump_to(&self, timestep: Timestep) {
        self.clock.lock().delayed = timestep;
    }

    pub fn delayed(&self) -> Timestep {
        self.clock.lock().delayed
    }
}

impl Default for ManualFrameCalculator {
    fn default() -> Self {
        Self::new(FrameTiming::default())
    }
}

impl FrameCalculator for ManualFrameCalculator {
    fn frame(&self) -> Frame {
        let clock = self.clock.lock();
        Frame {
            current: clock.delayed.saturating_add(clock.timing.input_delay as Timestep),
            delayed: clock.delayed,
        }
    }

    fn set(&mut self, timestep: Timestep) {
        self.jump_to(timestep);
    }

    fn timing(&self) -> FrameTiming {
        self.clock.lock().timing
    }

    fn set_timing(&mut self, timing: FrameTiming) {
        self.clock.lock().timing = timing;
    }
}
