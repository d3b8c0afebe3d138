/*
    ALICE-Replica
    Copyright (C) 2026 Moroya Sakamoto

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as
    published by the Free Software Foundation, either version 3 of the
    License, or (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! WorldState - the tick-indexed snapshot ring
//!
//! A fixed ring of `history_depth` snapshots plus the single mutable
//! `current` being built this tick. `ring[t % H]` holds the state at
//! the *start* of tick `t` (the result of tick `t-1`, including that
//! tick's dirty map). A slot is only trustworthy while its stamped tick
//! matches the requested one; anything older has been overwritten and
//! reads as unavailable, never as stale data.

use crate::config::ReplicaConfig;
use crate::snapshot::Snapshot;
use crate::tick::Tick;

#[derive(Debug)]
pub struct WorldState {
    ring: Vec<Snapshot>,
    /// The in-progress snapshot every write lands in.
    pub current: Snapshot,
    /// Tick whose start-state `ring` currently fronts.
    pub from_tick: Tick,
}

impl WorldState {
    #[must_use]
    pub fn new(cfg: &ReplicaConfig) -> Self {
        let mut ring = Vec::with_capacity(cfg.history_depth);
        for _ in 0..cfg.history_depth {
            let mut s = Snapshot::new(cfg);
            s.init(Tick::INVALID);
            ring.push(s);
        }
        let mut current = Snapshot::new(cfg);
        current.init(Tick::INVALID);
        Self {
            ring,
            current,
            from_tick: Tick::INVALID,
        }
    }

    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.ring.len()
    }

    /// Start tick `tick`: archive `current` (the result of `tick - 1`,
    /// dirty map included) into the ring, stamp it, then clear the
    /// dirty map so this tick's mutations diff against a clean slate.
    pub fn begin_tick(&mut self, tick: Tick) {
        let slot = tick.ring_slot(self.ring.len());
        self.current.copy_to(&mut self.ring[slot]);
        self.ring[slot].tick = tick;
        self.from_tick = tick;
        self.current.tick = tick;
        self.current.clear_dirty();
    }

    /// Client-side: overwrite the ring front with an authoritative
    /// snapshot instead of the local prediction.
    pub fn restore_from(&mut self, authoritative: &Snapshot) {
        let tick = authoritative.tick;
        let slot = tick.ring_slot(self.ring.len());
        authoritative.copy_to(&mut self.ring[slot]);
        authoritative.copy_to(&mut self.current);
        self.from_tick = tick;
    }

    /// Snapshot of the start of the in-progress tick.
    #[must_use]
    pub fn from_snapshot(&self) -> &Snapshot {
        let slot = self.from_tick.ring_slot(self.ring.len());
        &self.ring[slot]
    }

    /// State at the start of `tick`, if it still lives in the ring.
    /// Validates the stamped tick: an overwritten slot is unavailable.
    #[must_use]
    pub fn history(&self, tick: Tick) -> Option<&Snapshot> {
        if !tick.is_valid() {
            return None;
        }
        let slot = &self.ring[tick.ring_slot(self.ring.len())];
        (slot.tick == tick).then_some(slot)
    }

    /// `n` ticks before the ring front.
    #[must_use]
    pub fn history_back(&self, n: i32) -> Option<&Snapshot> {
        self.history(self.from_tick - n)
    }
}
