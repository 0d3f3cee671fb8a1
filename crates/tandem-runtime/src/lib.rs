//! TANDEM Runtime - The lockstep synchronizer
//!
//! `Synchronizer::think` runs one frame of the session:
//! 1. Pump the transport and admit new peers
//! 2. Flush local commands up to the current timestep
//! 3. Ingest, relay and record received packages
//! 4. Recompute invalidated timesteps
//! 5. Move the complete frontier and evict old history
//! 6. Reset the dirty frontier and publish the head
//! 7. Report lagging, game over or lost links

pub mod config;
pub mod synchronizer;

pub use config::*;
pub use synchronizer::*;
