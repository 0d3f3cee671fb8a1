//! Lockstep history window
//!
//! Three per-timestep windows share one capacity and one first index:
//! state snapshots, rosters and command batches. They are only ever
//! advanced together, so a timestep is either present in all three or in
//! none.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use tandem_core::{
    Command, EngineId, Roster, SimState, TandemError, TandemResult, TimeWindow, Timestep,
};

use crate::application_order;

/// Command batches recorded for one timestep, keyed by engine
pub type CommandBatch<S> = BTreeMap<EngineId, Vec<Command<S>>>;

/// Window capacity for a given `max_frames`
#[inline]
pub fn history_capacity(max_frames: usize) -> usize {
    max_frames.saturating_mul(2).saturating_add(1)
}

/// Bounded simulation history
pub struct HistoryWindow<S> {
    states: TimeWindow<Option<S>>,
    rosters: TimeWindow<Roster>,
    batches: TimeWindow<CommandBatch<S>>,
    max_frames: usize,
    /// Last timestep of the unbroken complete run
    complete: Timestep,
}

impl<S: SimState> HistoryWindow<S> {
    /// Window starting at `timestep`, with `state` installed there.
    ///
    /// The seed slot is marked computed and receives an empty batch from
    /// every expected engine, so it is complete by construction.
    pub fn seeded(
        max_frames: usize,
        timestep: Timestep,
        state: S,
        engines: impl IntoIterator<Item = EngineId>,
    ) -> TandemResult<Self> {
        let capacity = history_capacity(max_frames);
        let mut history = HistoryWindow {
            states: TimeWindow::new(capacity, timestep)?,
            rosters: TimeWindow::new(capacity, timestep)?,
            batches: TimeWindow::new(capacity, timestep)?,
            max_frames,
            complete: timestep,
        };

        let mut roster = Roster::with_engines(engines);
        roster.timestep = Some(timestep);
        let batch = history.batches.get_mut(timestep)?;
        for engine in roster.expected() {
            batch.insert(engine, Vec::new());
        }
        *history.rosters.get_mut(timestep)? = roster;
        *history.states.get_mut(timestep)? = Some(state);

        debug!(timestep, capacity, "history seeded");
        Ok(history)
    }

    /// Record `engine`'s batch for `timestep`
    pub fn record(
        &mut self,
        timestep: Timestep,
        engine: EngineId,
        commands: Vec<Command<S>>,
    ) -> TandemResult<()> {
        let batch = self.batches.get_mut(timestep)?;
        if batch.contains_key(&engine) {
            return Err(TandemError::DuplicatePackage { timestep, engine });
        }
        trace!(timestep, engine = %engine, commands = commands.len(), "batch recorded");
        batch.insert(engine, commands);
        Ok(())
    }

    /// Recompute the snapshot and roster at `timestep` from its predecessor.
    ///
    /// Returns `true` if the slot had been computed before (a rethink).
    pub fn recreate(&mut self, timestep: Timestep) -> TandemResult<bool> {
        let previous = timestep - 1;
        let mut state = self
            .states
            .get(previous)?
            .clone()
            .ok_or(TandemError::StateUnavailable(previous))?;
        let mut roster = self.rosters.get(previous)?.clone();
        roster.timestep = Some(timestep);

        let rethink = self.rosters.get(timestep)?.is_computed_for(timestep);
        let batch = self.batches.get(timestep)?;

        if !state.think() {
            roster.finished = true;
        }

        // Meta commands first, in ascending engine order
        for commands in batch.values() {
            for command in commands.iter().filter(|c| c.is_meta()) {
                command.apply_to_roster(&mut roster);
            }
        }

        let engines: Vec<EngineId> = batch.keys().copied().collect();
        for engine in application_order(&engines, timestep) {
            if let Some(commands) = batch.get(&engine) {
                for command in commands.iter().filter(|c| !c.is_meta()) {
                    command.apply_to_state(&mut state);
                }
            }
        }

        *self.states.get_mut(timestep)? = Some(state);
        *self.rosters.get_mut(timestep)? = roster;
        Ok(rethink)
    }

    /// Recompute every timestep in `from..=to`. Returns the rethink count.
    pub fn recreate_range(&mut self, from: Timestep, to: Timestep) -> TandemResult<u64> {
        let mut rethinks = 0;
        let mut timestep = from;
        while timestep <= to {
            if self.recreate(timestep)? {
                rethinks += 1;
            }
            timestep += 1;
        }
        Ok(rethinks)
    }

    /// True if every expected engine has a batch and the roster slot has
    /// been computed for this timestep
    pub fn is_complete(&self, timestep: Timestep) -> bool {
        let (Ok(roster), Ok(batch)) = (self.rosters.get(timestep), self.batches.get(timestep))
        else {
            return false;
        };
        roster.is_computed_for(timestep) && roster.expected().all(|e| batch.contains_key(&e))
    }

    /// Recompute the complete frontier from the start of the window.
    ///
    /// The frontier never moves backwards.
    pub fn update_complete(&mut self) -> TandemResult<Timestep> {
        let first = self.first_index();
        if !self.is_complete(first) {
            return Err(TandemError::IncompleteWindowInvariant {
                first,
                last: self.last_index(),
            });
        }

        let mut frontier = first;
        while frontier < self.last_index() && self.is_complete(frontier + 1) {
            frontier += 1;
        }
        if frontier > self.complete {
            trace!(from = self.complete, to = frontier, "complete frontier moved");
            self.complete = frontier;
        }
        Ok(self.complete)
    }

    /// Evict slots no longer needed to recompute anything past the frontier.
    /// Returns the number of evicted timesteps.
    pub fn advance(&mut self) -> usize {
        let mut evicted = 0;
        while self.first_index() < self.complete - 2 {
            self.states.advance();
            self.rosters.advance();
            self.batches.advance();
            evicted += 1;
        }
        evicted
    }

    pub fn first_index(&self) -> Timestep {
        self.states.first_index()
    }

    pub fn last_index(&self) -> Timestep {
        self.states.last_index()
    }

    pub fn contains(&self, timestep: Timestep) -> bool {
        self.states.contains(timestep)
    }

    pub fn capacity(&self) -> usize {
        self.states.capacity()
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn complete_timestep(&self) -> Timestep {
        self.complete
    }

    /// Computed snapshot at `timestep`
    pub fn state(&self, timestep: Timestep) -> TandemResult<&S> {
        self.states
            .get(timestep)?
            .as_ref()
            .ok_or(TandemError::StateUnavailable(timestep))
    }

    pub fn roster(&self, timestep: Timestep) -> TandemResult<&Roster> {
        self.rosters.get(timestep)
    }

    pub fn batch(&self, timestep: Timestep) -> TandemResult<&CommandBatch<S>> {
        self.batches.get(timestep)
    }

    pub fn has_batch(&self, timestep: Timestep, engine: EngineId) -> bool {
        self.batches
            .get(timestep)
            .map(|batch| batch.contains_key(&engine))
            .unwrap_or(false)
    }
}
