//! TANDEM State - Simulation history and rollback
//!
//! This crate owns the per-timestep history of a synchronizer:
//! - State snapshots, rosters and command batches in one lockstep window
//! - Recomputation of a timestep from its predecessor
//! - The deterministic command application order
//! - The complete frontier and safe eviction

pub mod history;
pub mod order;

pub use history::*;
pub use order::*;
