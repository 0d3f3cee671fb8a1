//! Command application order within one timestep

use tandem_core::{EngineId, Timestep};

/// Order in which engines' application commands are applied at `timestep`.
///
/// `engines` must be sorted. The engine at rotated index `i` is
/// `engines[(i + timestep) mod len]`, so the engine that goes first changes
/// from one timestep to the next. Meta commands are not subject to rotation;
/// they run first, in ascending engine order.
pub fn application_order(engines: &[EngineId], timestep: Timestep) -> Vec<EngineId> {
    let len = engines.len() as i64;
    (0..len)
        .map(|i| {
            let index = (i + timestep as i64).rem_euclid(len);
            engines[index as usize]
        })
        .collect()
}
