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

//! Simulation inputs - pooled, tick-targeted, never reallocated
//!
//! Inputs are drawn from a free queue sized to the prediction window,
//! so a steady-state tick performs zero input allocation. A server
//! holds one bounded queue per connection where the *oldest* input wins
//! starvation contests: once the queue is full, new packets are
//! rejected rather than evicting queued input, and a sequence guard
//! drops anything at or below the last accepted target tick.

use crate::entity::ConnectionId;
use crate::tick::Tick;
use std::collections::VecDeque;

/// One typed input block: a tag plus a raw byte payload. Blocks are
/// never partially overwritten; a recycle clears the whole input.
#[derive(Debug, Clone, Default)]
pub struct InputBlock {
    pub type_id: i16,
    pub payload: Vec<u8>,
}

/// Per-tick container of typed input blocks, with the bookkeeping lag
/// compensation needs.
#[derive(Debug, Clone)]
pub struct SimulationInput {
    /// Tick this input wants to drive.
    pub target_tick: Tick,
    /// Tick at which the client authored it.
    pub author_tick: Tick,
    /// Client's interpolation alpha when the input was authored.
    pub alpha: f32,
    /// Remote-view base tick the client was rendering against.
    pub remote_from_tick: Tick,
    blocks: Vec<InputBlock>,
}

impl SimulationInput {
    fn with_capacity(types: usize) -> Self {
        Self {
            target_tick: Tick::INVALID,
            author_tick: Tick::INVALID,
            alpha: 0.0,
            remote_from_tick: Tick::INVALID,
            blocks: Vec::with_capacity(types),
        }
    }

    /// Reset to empty; block buffers keep their capacity.
    pub fn clear(&mut self) {
        self.target_tick = Tick::INVALID;
        self.author_tick = Tick::INVALID;
        self.alpha = 0.0;
        self.remote_from_tick = Tick::INVALID;
        for b in &mut self.blocks {
            b.type_id = 0;
            b.payload.clear();
        }
        self.blocks.clear();
    }

    /// Append one typed block.
    pub fn push_block(&mut self, type_id: i16, payload: &[u8]) {
        let mut block = InputBlock {
            type_id,
            payload: Vec::with_capacity(payload.len()),
        };
        block.payload.extend_from_slice(payload);
        self.blocks.push(block);
    }

    /// First block of the given type, if present.
    #[must_use]
    pub fn block(&self, type_id: i16) -> Option<&[u8]> {
        self.blocks
            .iter()
            .find(|b| b.type_id == type_id)
            .map(|b| b.payload.as_slice())
    }

    #[must_use]
    pub fn blocks(&self) -> &[InputBlock] {
        &self.blocks
    }
}

/// Pool slot index; small, recycled via a free queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputId(pub u16);

impl InputId {
    pub const INVALID: Self = Self(u16::MAX);
}

/// Fixed pool of `SimulationInput`s with O(1) create/recycle.
#[derive(Debug)]
pub struct InputPool {
    slots: Vec<SimulationInput>,
    free: VecDeque<u16>,
}

impl InputPool {
    #[must_use]
    pub fn new(capacity: usize, types_per_input: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| SimulationInput::with_capacity(types_per_input))
            .collect();
        Self {
            slots,
            free: (0..capacity as u16).collect(),
        }
    }

    /// Draw a cleared input from the free queue. `None` means the
    /// prediction window is saturated; callers drop the new input.
    pub fn create(&mut self) -> Option<InputId> {
        self.free.pop_front().map(InputId)
    }

    /// Return an input to the free queue.
    pub fn recycle(&mut self, id: InputId) {
        self.slots[id.0 as usize].clear();
        debug_assert!(!self.free.contains(&id.0), "double recycle of {id:?}");
        self.free.push_back(id.0);
    }

    #[inline]
    #[must_use]
    pub fn get(&self, id: InputId) -> &SimulationInput {
        &self.slots[id.0 as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, id: InputId) -> &mut SimulationInput {
        &mut self.slots[id.0 as usize]
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// Server-side per-connection input state.
#[derive(Debug)]
pub struct ClientData {
    pub connection: ConnectionId,
    queue: VecDeque<InputId>,
    max_queued: usize,
    /// Sequence guard: highest accepted target tick.
    pub last_target_tick: Tick,
    /// Last snapshot tick the client acknowledged receiving.
    pub acked_tick: Tick,
    /// Inter-packet arrival delta, echoed to the client for its clock.
    pub inter_packet_delta: f64,
    /// Force the next send to be a full snapshot.
    pub needs_full: bool,
}

impl ClientData {
    #[must_use]
    pub fn new(connection: ConnectionId, max_queued: usize) -> Self {
        Self {
            connection,
            queue: VecDeque::with_capacity(max_queued),
            max_queued,
            last_target_tick: Tick::INVALID,
            acked_tick: Tick::INVALID,
            inter_packet_delta: 0.0,
            needs_full: true,
        }
    }

    /// Try to enqueue a received input. The oldest queued input wins:
    /// a full queue rejects the newcomer, and the sequence guard drops
    /// anything not strictly beyond the last accepted target.
    pub fn accept(&mut self, pool: &mut InputPool, id: InputId) -> bool {
        let target = pool.get(id).target_tick;
        if self.queue.len() >= self.max_queued || target <= self.last_target_tick {
            pool.recycle(id);
            return false;
        }
        self.last_target_tick = target;
        self.queue.push_back(id);
        true
    }

    /// Input driving `tick`, if one is queued. Inputs that missed their
    /// tick are recycled on the way.
    pub fn take_for_tick(&mut self, pool: &mut InputPool, tick: Tick) -> Option<InputId> {
        while let Some(&front) = self.queue.front() {
            let target = pool.get(front).target_tick;
            if target < tick {
                self.queue.pop_front();
                pool.recycle(front);
                log::trace!(
                    "conn {:?}: input for {} arrived too late (now {})",
                    self.connection,
                    target,
                    tick
                );
            } else if target == tick {
                self.queue.pop_front();
                return Some(front);
            } else {
                return None;
            }
        }
        None
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Recycle everything still queued (connection teardown).
    pub fn drain(&mut self, pool: &mut InputPool) {
        while let Some(id) = self.queue.pop_front() {
            pool.recycle(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(pool: &mut InputPool, target: i32) -> InputId {
        let id = pool.create().unwrap();
        let input = pool.get_mut(id);
        input.target_tick = Tick(target);
        input.author_tick = Tick(target - 1);
        input.push_block(1, &[target as u8]);
        id
    }

    #[test]
    fn test_pool_create_recycle_no_leak() {
        let mut pool = InputPool::new(4, 2);
        let ids: Vec<_> = (0..4).map(|_| pool.create().unwrap()).collect();
        assert!(pool.create().is_none());
        for id in ids {
            pool.recycle(id);
        }
        assert_eq!(pool.available(), 4);
        // recycled inputs come back cleared
        let id = pool.create().unwrap();
        assert_eq!(pool.get(id).target_tick, Tick::INVALID);
        assert!(pool.get(id).blocks().is_empty());
    }

    #[test]
    fn test_typed_block_lookup() {
        let mut pool = InputPool::new(2, 2);
        let id = filled(&mut pool, 5);
        let input = pool.get(id);
        assert_eq!(input.block(1), Some(&[5u8][..]));
        assert_eq!(input.block(9), None);
    }

    #[test]
    fn test_queue_oldest_wins_when_full() {
        let mut pool = InputPool::new(8, 1);
        let mut client = ClientData::new(ConnectionId(0), 2);

        let a = filled(&mut pool, 1);
        let b = filled(&mut pool, 2);
        let c = filled(&mut pool, 3);
        assert!(client.accept(&mut pool, a));
        assert!(client.accept(&mut pool, b));
        // queue full: the newcomer is rejected and recycled
        assert!(!client.accept(&mut pool, c));
        assert_eq!(client.queued(), 2);
        assert_eq!(pool.available(), 8 - 2);
    }

    #[test]
    fn test_sequence_guard_rejects_replays() {
        let mut pool = InputPool::new(8, 1);
        let mut client = ClientData::new(ConnectionId(0), 4);

        let a = filled(&mut pool, 5);
        assert!(client.accept(&mut pool, a));
        // same target again: dropped
        let dup = filled(&mut pool, 5);
        assert!(!client.accept(&mut pool, dup));
        // older target: dropped
        let old = filled(&mut pool, 3);
        assert!(!client.accept(&mut pool, old));
        // newer target: accepted
        let next = filled(&mut pool, 6);
        assert!(client.accept(&mut pool, next));
    }

    #[test]
    fn test_take_for_tick_skips_late_input() {
        let mut pool = InputPool::new(8, 1);
        let mut client = ClientData::new(ConnectionId(0), 4);
        for t in [3, 4, 6] {
            let id = filled(&mut pool, t);
            assert!(client.accept(&mut pool, id));
        }

        // tick 5: inputs for 3 and 4 are late and recycled, 6 stays queued
        assert!(client.take_for_tick(&mut pool, Tick(5)).is_none());
        assert_eq!(client.queued(), 1);

        let id = client.take_for_tick(&mut pool, Tick(6)).unwrap();
        assert_eq!(pool.get(id).target_tick, Tick(6));
        pool.recycle(id);
    }
}
