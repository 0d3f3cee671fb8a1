//! TANDEM Time - Mapping wall-clock time to timesteps
//!
//! Every peer derives two timesteps per frame:
//! - `current`: where locally applied commands land (includes the input delay)
//! - `delayed`: the newest timestep that is safe to compute this frame
//!
//! Peers agree on the mapping by sharing [`FrameTiming`] during the join.

pub mod calculator;
pub mod clock;

pub use calculator::*;
pub use clock::*;
