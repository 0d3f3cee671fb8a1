//! Synchronizer configuration

use std::time::Duration;

use tandem_core::{TandemError, TandemResult};
use tandem_state::history_capacity;
use tandem_time::FrameTiming;

/// Synchronizer configuration
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Half the history window. The window holds `max_frames * 2 + 1`
    /// timesteps.
    pub max_frames: usize,
    /// How long a joiner waits for the connection and then for the snapshot
    pub connect_timeout: Duration,
    /// Packages ahead of the window kept for later
    pub max_deferred_packages: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_frames: 50,
            connect_timeout: Duration::from_secs(5),
            max_deferred_packages: 1024,
        }
    }
}

impl SyncConfig {
    /// Configuration for LAN sessions
    pub fn lan() -> Self {
        SyncConfig {
            max_frames: 20,
            connect_timeout: Duration::from_secs(2),
            max_deferred_packages: 512,
        }
    }

    /// Configuration for long-haul or lossy links
    pub fn high_latency() -> Self {
        SyncConfig {
            max_frames: 150,
            connect_timeout: Duration::from_secs(15),
            max_deferred_packages: 4096,
        }
    }

    pub fn history_capacity(&self) -> usize {
        history_capacity(self.max_frames)
    }

    /// Check the window can hold the input-delay allowance
    pub fn validate(&self, timing: &FrameTiming) -> TandemResult<()> {
        timing.validate()?;
        if self.max_frames == 0 {
            return Err(TandemError::InvalidConfig("max_frames must be positive".into()));
        }
        if self.max_frames > (i32::MAX as usize - 1) / 2 {
            return Err(TandemError::InvalidConfig(format!(
                "max_frames {} too large",
                self.max_frames
            )));
        }
        let needed = timing.input_delay as usize + 4;
        if self.history_capacity() < needed {
            return Err(TandemError::InvalidConfig(format!(
                "history of {} timesteps cannot cover input delay {}",
                self.history_capacity(),
                timing.input_delay
            )));
        }
        Ok(())
    }
}
