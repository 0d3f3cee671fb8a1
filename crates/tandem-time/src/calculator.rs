//! Frame calculator contract and timing parameters

use std::time::Duration;

use tandem_core::{TandemError, TandemResult, Timestep};

/// Timesteps derived for one frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Timestep that locally applied commands are submitted for
    pub current: Timestep,
    /// Newest timestep that may be computed this frame
    pub delayed: Timestep,
}

impl Frame {
    pub fn new(current: Timestep, delayed: Timestep) -> Self {
        Frame { current, delayed }
    }
}

/// Frame timing shared by every peer in a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTiming {
    /// Wall-clock length of one timestep
    pub ms_per_frame: u32,
    /// Timesteps between `delayed` and `current`
    pub input_delay: u32,
}

impl Default for FrameTiming {
    fn default() -> Self {
        FrameTiming {
            ms_per_frame: 33,
            input_delay: 2,
        }
    }
}

impl FrameTiming {
    pub fn new(ms_per_frame: u32, input_delay: u32) -> Self {
        FrameTiming {
            ms_per_frame,
            input_delay,
        }
    }

    /// Timing for LAN sessions (60 Hz, one frame of delay)
    pub fn lan() -> Self {
        FrameTiming {
            ms_per_frame: 16,
            input_delay: 1,
        }
    }

    /// Timing for long-haul links
    pub fn high_latency() -> Self {
        FrameTiming {
            ms_per_frame: 50,
            input_delay: 6,
        }
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.ms_per_frame as u64)
    }

    pub fn validate(&self) -> TandemResult<()> {
        if self.ms_per_frame == 0 {
            return Err(TandemError::InvalidConfig(
                "ms_per_frame must be positive".into(),
            ));
        }
        if self.input_delay > i32::MAX as u32 {
            return Err(TandemError::InvalidConfig(format!(
                "input_delay {} out of range",
                self.input_delay
            )));
        }
        Ok(())
    }
}

/// Source of `(current, delayed)` timesteps for a synchronizer
pub trait FrameCalculator: Send {
    /// Timesteps for the frame in progress
    fn frame(&self) -> Frame;

    /// Rebase so that `frame().delayed == timestep` from now on
    fn set(&mut self, timestep: Timestep);

    fn timing(&self) -> FrameTiming;

    /// Replace the timing, keeping the current delayed timestep
    fn set_timing(&mut self, timing: FrameTiming);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_defaults() {
        let timing = FrameTiming::default();
        assert_eq!(timing.ms_per_frame, 33);
        assert_eq!(timing.input_delay, 2);
        assert_eq!(timing.frame_duration(), Duration::from_millis(33));
        assert!(timing.validate().is_ok());
    }

    #[test]
    fn test_timing_presets() {
        assert!(FrameTiming::lan().ms_per_frame < FrameTiming::default().ms_per_frame);
        assert!(FrameTiming::high_latency().input_delay > FrameTiming::default().input_delay);
    }

    #[test]
    fn test_zero_frame_length_rejected() {
        assert!(matches!(
            FrameTiming::new(0, 2).validate(),
            Err(TandemError::InvalidConfig(_))
        ));
    }
}
