//! Per-timestep roster metadata

use std::collections::BTreeSet;

use crate::{EngineId, Timestep};

/// Engines expected to contribute to one timestep.
///
/// Only meta commands change the engine set. `timestep` is written when the
/// slot is computed, so a slot that was never recreated is never mistaken for
/// a finished one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Roster {
    pub engines: BTreeSet<EngineId>,
    pub timestep: Option<Timestep>,
    /// Set when the transition function reported the end of the simulation
    pub finished: bool,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engines(engines: impl IntoIterator<Item = EngineId>) -> Self {
        Roster {
            engines: engines.into_iter().collect(),
            timestep: None,
            finished: false,
        }
    }

    #[inline]
    pub fn contains(&self, engine: EngineId) -> bool {
        self.engines.contains(&engine)
    }

    pub fn insert(&mut self, engine: EngineId) -> bool {
        self.engines.insert(engine)
    }

    pub fn remove(&mut self, engine: EngineId) -> bool {
        self.engines.remove(&engine)
    }

    /// True once this slot has been computed for `timestep`
    #[inline]
    pub fn is_computed_for(&self, timestep: Timestep) -> bool {
        self.timestep == Some(timestep)
    }

    /// Engines whose batches gate completion: the roster plus the host
    pub fn expected(&self) -> impl Iterator<Item = EngineId> + '_ {
        let host = (!self.engines.contains(&EngineId::HOST)).then_some(EngineId::HOST);
        host.into_iter().chain(self.engines.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}
