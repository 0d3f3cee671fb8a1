//! Fixed-capacity, timestep-indexed window
//!
//! Slots are addressed by logical timestep; the ring offset never leaks out.
//! Advancing drops the oldest slot and opens a fresh default slot at the far
//! end, so memory stays bounded however long the simulation runs.

use crate::{TandemError, TandemResult, Timestep};

/// Circular buffer covering `[first_index, first_index + capacity - 1]`
#[derive(Clone, Debug)]
pub struct TimeWindow<T> {
    slots: Vec<T>,
    first: Timestep,
}

impl<T: Default> TimeWindow<T> {
    /// Create a window of `capacity` default slots starting at `first`
    pub fn new(capacity: usize, first: Timestep) -> TandemResult<Self> {
        if capacity == 0 || capacity > i32::MAX as usize {
            return Err(TandemError::InvalidWindowCapacity(capacity));
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, T::default);
        Ok(TimeWindow { slots, first })
    }

    /// Evict the slot at `first_index` and open a default slot at
    /// `last_index + 1`.
    pub fn advance(&mut self) {
        // The evicted slot and the new trailing slot share one ring offset.
        let offset = self.offset(self.first);
        self.slots[offset] = T::default();
        self.first += 1;
    }
}

impl<T> TimeWindow<T> {
    #[inline]
    pub fn first_index(&self) -> Timestep {
        self.first
    }

    #[inline]
    pub fn last_index(&self) -> Timestep {
        self.first.saturating_add(self.slots.len() as i32 - 1)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn contains(&self, index: Timestep) -> bool {
        let index = index as i64;
        let first = self.first as i64;
        index >= first && index < first + self.slots.len() as i64
    }

    pub fn get(&self, index: Timestep) -> TandemResult<&T> {
        self.check(index)?;
        Ok(&self.slots[self.offset(index)])
    }

    pub fn get_mut(&mut self, index: Timestep) -> TandemResult<&mut T> {
        self.check(index)?;
        let offset = self.offset(index);
        Ok(&mut self.slots[offset])
    }

    /// Iterate slots from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = (Timestep, &T)> + '_ {
        (0..self.slots.len()).map(move |i| {
            let index = self.first + i as i32;
            (index, &self.slots[self.offset(index)])
        })
    }

    fn check(&self, index: Timestep) -> TandemResult<()> {
        if self.contains(index) {
            Ok(())
        } else {
            Err(TandemError::OutOfWindow {
                index,
                first: self.first_index(),
                last: self.last_index(),
            })
        }
    }

    #[inline]
    fn offset(&self, index: Timestep) -> usize {
        (index as i64).rem_euclid(self.slots.len() as i64) as usize
    }
}
