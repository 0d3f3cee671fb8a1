//! Simulation state contract
//!
//! TANDEM never looks inside a state. It only decides when `think` runs and
//! which commands are applied, so every peer must implement these as pure
//! functions of the previous snapshot and the ordered command batch.

use crate::TandemResult;

/// Deterministic simulation state owned by a synchronizer
pub trait SimState: Clone + Send + 'static {
    /// Advance one tick. Returns `false` once the simulation has ended.
    fn think(&mut self) -> bool;

    /// Serialize a full snapshot
    fn encode(&self) -> Vec<u8>;

    /// Rebuild a snapshot produced by [`SimState::encode`]
    fn decode(data: &[u8]) -> TandemResult<Self>;
}
