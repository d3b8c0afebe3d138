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

//! Snapshot - a complete copy of the world at one tick
//!
//! One allocator instance holding every entity's state + dirty blocks,
//! a fixed metadata array indexed by `worldMetaId`, and a per-meta
//! dirty flag. `copy_to` is the only way state crosses snapshots; no
//! aliasing between snapshot instances exists anywhere in the engine,
//! which is what makes rollback and history reads safe single-threaded.

use crate::alloc::BlockAllocator;
use crate::config::ReplicaConfig;
use crate::entity::{ConnectionId, EntityRef, PrefabId};
use crate::state::StateSlot;
use crate::tick::Tick;
use crate::{ReplicaError, Result};

/// Fixed-slot entity metadata, index-addressed by `worldMetaId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMeta {
    pub entity_ref: EntityRef,
    pub prefab: PrefabId,
    pub input_source: ConnectionId,
    pub destroyed: bool,
}

impl EntityMeta {
    /// Empty slot sentinel.
    pub const INVALID: Self = Self {
        entity_ref: EntityRef::INVALID,
        prefab: PrefabId(0),
        input_source: ConnectionId::NONE,
        destroyed: false,
    };

    #[inline(always)]
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.entity_ref.is_valid()
    }
}

impl Default for EntityMeta {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Point-in-time world capture: metadata array + state allocator.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tick: Tick,
    alloc: BlockAllocator,
    metas: Vec<EntityMeta>,
    slots: Vec<StateSlot>,
    meta_dirty: Vec<bool>,
}

impl Snapshot {
    #[must_use]
    pub fn new(cfg: &ReplicaConfig) -> Self {
        Self {
            tick: Tick::INVALID,
            alloc: BlockAllocator::new(cfg.allocator_words()),
            metas: vec![EntityMeta::INVALID; cfg.max_entities],
            slots: vec![StateSlot::INVALID; cfg.max_entities],
            meta_dirty: vec![false; cfg.max_entities],
        }
    }

    /// Zero all meta/dirty state and release every allocation.
    pub fn init(&mut self, tick: Tick) {
        self.tick = tick;
        self.metas.fill(EntityMeta::INVALID);
        self.slots.fill(StateSlot::INVALID);
        self.meta_dirty.fill(false);
        self.alloc.reset();
    }

    /// Full deep copy into `dest`: metadata, dirty flags, every pool.
    /// O(entities); never aliases.
    pub fn copy_to(&self, dest: &mut Snapshot) {
        dest.tick = self.tick;
        dest.metas.copy_from_slice(&self.metas);
        dest.slots.copy_from_slice(&self.slots);
        dest.meta_dirty.copy_from_slice(&self.meta_dirty);
        self.alloc.copy_to(&mut dest.alloc);
    }

    #[inline]
    #[must_use]
    pub fn max_entities(&self) -> usize {
        self.metas.len()
    }

    // --- metadata --------------------------------------------------------

    /// # Panics
    /// Panics on an out-of-range meta index (configured bounds are a
    /// hard contract, see error taxonomy).
    #[inline]
    #[must_use]
    pub fn meta(&self, meta_id: u16) -> &EntityMeta {
        &self.metas[meta_id as usize]
    }

    /// Overwrite a metadata slot and flag it dirty.
    pub fn set_meta(&mut self, meta_id: u16, meta: EntityMeta) {
        self.metas[meta_id as usize] = meta;
        self.meta_dirty[meta_id as usize] = true;
    }

    /// Mark an entity's metadata destroyed without clearing the slot;
    /// the removal record still replicates this tick.
    pub fn mark_destroyed(&mut self, meta_id: u16) {
        self.metas[meta_id as usize].destroyed = true;
        self.meta_dirty[meta_id as usize] = true;
    }

    #[inline]
    #[must_use]
    pub fn is_meta_dirty(&self, meta_id: u16) -> bool {
        self.meta_dirty[meta_id as usize]
    }

    #[inline]
    #[must_use]
    pub fn slot(&self, meta_id: u16) -> StateSlot {
        self.slots[meta_id as usize]
    }

    /// Iterate occupied meta slots.
    pub fn live_metas(&self) -> impl Iterator<Item = (u16, &EntityMeta)> {
        self.metas
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_valid())
            .map(|(i, m)| (i as u16, m))
    }

    // --- entity storage --------------------------------------------------

    /// Allocate state + dirty blocks for a new entity and occupy its
    /// metadata slot.
    ///
    /// # Errors
    /// `PoolExhausted` when the preallocated arena cannot hold another
    /// entity — a fatal configuration error by contract.
    pub fn alloc_entity(
        &mut self,
        meta_id: u16,
        meta: EntityMeta,
        words: u32,
    ) -> Result<StateSlot> {
        let state = self
            .alloc
            .malloc(words)
            .ok_or(ReplicaError::PoolExhausted { words })?;
        let dirty = match self.alloc.malloc(words) {
            Some(d) => d,
            None => {
                self.alloc.free(state);
                return Err(ReplicaError::PoolExhausted { words });
            }
        };
        let slot = StateSlot {
            state,
            dirty,
            words,
        };
        self.slots[meta_id as usize] = slot;
        self.set_meta(meta_id, meta);
        Ok(slot)
    }

    /// Release an entity's blocks and clear its slot.
    pub fn free_entity(&mut self, meta_id: u16) {
        let slot = self.slots[meta_id as usize];
        if slot.is_valid() {
            self.alloc.free(slot.state);
            self.alloc.free(slot.dirty);
        }
        self.slots[meta_id as usize] = StateSlot::INVALID;
        self.metas[meta_id as usize] = EntityMeta::INVALID;
        self.meta_dirty[meta_id as usize] = true;
    }

    /// Install an externally-described slot (client side: the server
    /// dictates meta ids; blocks are allocated to the announced size).
    pub fn adopt_entity(
        &mut self,
        meta_id: u16,
        meta: EntityMeta,
        words: u32,
    ) -> Result<StateSlot> {
        if self.slots[meta_id as usize].is_valid() {
            // re-announced entity keeps its blocks
            self.set_meta(meta_id, meta);
            return Ok(self.slots[meta_id as usize]);
        }
        self.alloc_entity(meta_id, meta, words)
    }

    // --- word access -----------------------------------------------------

    /// Compare-and-write one state word. Returns `Some((old, new))`
    /// and sets the dirty word only when the value actually changed.
    pub fn write_word(&mut self, meta_id: u16, word: u16, value: u32) -> Option<(u32, u32)> {
        let slot = self.slots[meta_id as usize];
        assert!(slot.is_valid(), "write to empty meta slot {meta_id}");
        let old = self.alloc.word(slot.state, u32::from(word));
        if old == value {
            return None;
        }
        self.alloc.set_word(slot.state, u32::from(word), value);
        self.alloc.set_word(slot.dirty, u32::from(word), 1);
        Some((old, value))
    }

    /// Overwrite a word *without* dirty tracking (reconciliation apply
    /// writes authoritative words through this).
    pub fn overwrite_word(&mut self, meta_id: u16, word: u16, value: u32) {
        let slot = self.slots[meta_id as usize];
        assert!(slot.is_valid(), "write to empty meta slot {meta_id}");
        self.alloc.set_word(slot.state, u32::from(word), value);
    }

    #[inline]
    #[must_use]
    pub fn read_word(&self, meta_id: u16, word: u16) -> u32 {
        let slot = self.slots[meta_id as usize];
        assert!(slot.is_valid(), "read from empty meta slot {meta_id}");
        self.alloc.word(slot.state, u32::from(word))
    }

    /// All state words of one entity.
    #[must_use]
    pub fn state_words(&self, meta_id: u16) -> &[u32] {
        let slot = self.slots[meta_id as usize];
        assert!(slot.is_valid(), "read from empty meta slot {meta_id}");
        &self.alloc.payload(slot.state)[..slot.words as usize]
    }

    /// Dirty map words of one entity (1 = changed since tick reset).
    #[must_use]
    pub fn dirty_words(&self, meta_id: u16) -> &[u32] {
        let slot = self.slots[meta_id as usize];
        assert!(slot.is_valid(), "read from empty meta slot {meta_id}");
        &self.alloc.payload(slot.dirty)[..slot.words as usize]
    }

    /// Indices + values of words marked dirty for one entity.
    pub fn changed_words(&self, meta_id: u16) -> impl Iterator<Item = (u16, u32)> + '_ {
        let state = self.state_words(meta_id);
        self.dirty_words(meta_id)
            .iter()
            .enumerate()
            .filter(|(_, &d)| d != 0)
            .map(move |(i, _)| (i as u16, state[i]))
    }

    #[inline]
    #[must_use]
    pub fn has_dirty_state(&self, meta_id: u16) -> bool {
        self.slots[meta_id as usize].is_valid()
            && self.dirty_words(meta_id).iter().any(|&d| d != 0)
    }

    /// End-of-tick reset: clear every dirty map and meta flag.
    pub fn clear_dirty(&mut self) {
        for i in 0..self.slots.len() {
            let slot = self.slots[i];
            if slot.is_valid() {
                self.alloc.payload_mut(slot.dirty)[..slot.words as usize].fill(0);
            }
        }
        self.meta_dirty.fill(false);
    }
}
