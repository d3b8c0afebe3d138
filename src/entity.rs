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

//! Entities, scripts and the prefab registry
//!
//! An entity is glue: a stable server-assigned reference, a slot in the
//! metadata array, two blocks in the snapshot allocator, and a list of
//! `NetworkScript` capabilities composed per prefab. Scripts never touch
//! memory directly; they read and write words through bounds-checked
//! views over the current snapshot.
//!
//! The prefab registry is the runtime face of the (external) build-time
//! field codegen: each prefab registers its word count, script factory
//! and per-word change hooks once, before the simulation starts.

use crate::input::SimulationInput;
use crate::snapshot::Snapshot;
use crate::state::{CallbackTable, ChangeNotice, ChangeSource, StateSlot};
use bitcode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;

/// Stable entity identifier, assigned by the server at spawn and shared
/// verbatim by every peer. `-1` is invalid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub struct EntityRef(pub i32);

impl EntityRef {
    pub const INVALID: Self = Self(-1);

    #[inline(always)]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl Default for EntityRef {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Transport-level connection identifier. `-1` means "no owner".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub struct ConnectionId(pub i32);

impl ConnectionId {
    pub const NONE: Self = Self(-1);

    #[inline(always)]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::NONE
    }
}

/// Registered entity type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub struct PrefabId(pub u16);

/// Opaque handle to the host engine's game object for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalHandle(pub u64);

/// Per-tick context handed to script hooks.
pub struct ScriptCtx<'a> {
    /// The simulation's mutable current snapshot.
    pub snapshot: &'a mut Snapshot,
    /// Tick being simulated.
    pub tick: crate::tick::Tick,
    /// Input addressed to this entity's owning connection, if any
    /// arrived for this tick.
    pub input: Option<&'a SimulationInput>,
    /// True while re-executing ticks inside a reconciliation pass.
    pub resimulating: bool,
    /// Deferred spawn/destroy requests, drained by the simulation core.
    pub commands: &'a mut Vec<SimCommand>,
    pub(crate) meta_id: u16,
    pub(crate) entity_ref: EntityRef,
    pub(crate) dirty: &'a mut bool,
    pub(crate) notices: &'a mut Vec<ChangeNotice>,
}

impl<'a> ScriptCtx<'a> {
    #[inline]
    #[must_use]
    pub fn entity(&self) -> EntityRef {
        self.entity_ref
    }

    /// Read one state word of this entity.
    #[inline]
    #[must_use]
    pub fn read_word(&self, word: u16) -> u32 {
        self.snapshot.read_word(self.meta_id, word)
    }

    #[inline]
    #[must_use]
    pub fn read_f32(&self, word: u16) -> f32 {
        crate::state::word_to_f32(self.read_word(word))
    }

    #[inline]
    #[must_use]
    pub fn read_i32(&self, word: u16) -> i32 {
        crate::state::word_to_i32(self.read_word(word))
    }

    /// Compare-and-write one state word. Unchanged values mark nothing;
    /// a change sets the dirty word, flags the entity and queues the
    /// word's change notice.
    pub fn write_word(&mut self, word: u16, value: u32) {
        if let Some((old, new)) = self.snapshot.write_word(self.meta_id, word, value) {
            *self.dirty = true;
            self.notices.push(ChangeNotice {
                entity: self.entity_ref,
                meta_id: self.meta_id,
                word,
                old,
                new,
                source: if self.resimulating {
                    ChangeSource::Resimulated
                } else {
                    ChangeSource::Predicted
                },
            });
        }
    }

    #[inline]
    pub fn write_f32(&mut self, word: u16, value: f32) {
        self.write_word(word, crate::state::f32_to_word(value));
    }

    #[inline]
    pub fn write_i32(&mut self, word: u16, value: i32) {
        self.write_word(word, crate::state::i32_to_word(value));
    }

    /// Stage a spawn; it becomes live one tick later (after the send).
    pub fn spawn(&mut self, prefab: PrefabId, owner: ConnectionId) {
        self.commands.push(SimCommand::Spawn { prefab, owner });
    }

    /// Stage a destroy; final state is still replicated this tick.
    pub fn destroy(&mut self, entity: EntityRef) {
        self.commands.push(SimCommand::Destroy { entity });
    }
}

/// Deferred lifecycle request raised by a script during its tick.
#[derive(Debug, Clone, Copy)]
pub enum SimCommand {
    Spawn { prefab: PrefabId, owner: ConnectionId },
    Destroy { entity: EntityRef },
}

/// Capability trait composed per entity, replacing a behavior class
/// hierarchy: every hook has a no-op default, scripts implement what
/// they need.
pub trait NetworkScript {
    /// First tick after the entity entered the live list.
    fn on_start(&mut self, _ctx: &mut ScriptCtx) {}
    /// Once per simulation tick, before physics.
    fn on_fixed_update(&mut self, _ctx: &mut ScriptCtx) {}
    /// Once per rendered frame (never during resimulation).
    fn on_update(&mut self, _ctx: &mut ScriptCtx) {}
    /// Render-time hook with interpolation already applied by the host.
    fn on_render(&mut self, _ctx: &mut ScriptCtx) {}
    /// Entity is leaving the live list; state was already replicated.
    fn on_destroy(&mut self, _ctx: &mut ScriptCtx) {}
    /// Pack local fields into state words (compare-on-write).
    fn serialize(&mut self, _ctx: &mut ScriptCtx) {}
    /// Load local fields back from state words (rollback restore).
    fn deserialize(&mut self, _ctx: &mut ScriptCtx) {}
}

/// A live entity: identity, memory slot and composed scripts.
pub struct Entity {
    pub entity_ref: EntityRef,
    pub meta_id: u16,
    pub prefab: PrefabId,
    pub input_source: ConnectionId,
    pub slot: StateSlot,
    /// Set by any changed word this tick; cleared by `tick_reset`.
    pub dirty: bool,
    /// Back-reference to the host engine's spawned object.
    pub external: Option<ExternalHandle>,
    pub(crate) started: bool,
    pub(crate) scripts: Vec<Box<dyn NetworkScript>>,
    pub(crate) callbacks: Rc<CallbackTable>,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("entity_ref", &self.entity_ref)
            .field("meta_id", &self.meta_id)
            .field("prefab", &self.prefab)
            .field("input_source", &self.input_source)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

type ScriptFactory = Box<dyn Fn() -> Vec<Box<dyn NetworkScript>>>;

/// One registered prefab: state size, script factory, change hooks.
pub struct PrefabDef {
    pub prefab: PrefabId,
    pub words: u32,
    factory: ScriptFactory,
    callbacks: CallbackTable,
}

impl PrefabDef {
    #[must_use]
    pub fn new(
        prefab: PrefabId,
        words: u32,
        factory: impl Fn() -> Vec<Box<dyn NetworkScript>> + 'static,
    ) -> Self {
        Self {
            prefab,
            words,
            factory: Box::new(factory),
            callbacks: CallbackTable::new(words),
        }
    }

    /// Attach a change hook to one word offset.
    #[must_use]
    pub fn with_hook(
        mut self,
        word: u16,
        invoke_during_resim: bool,
        func: impl Fn(&ChangeNotice) + 'static,
    ) -> Self {
        self.callbacks.on_change(word, invoke_during_resim, func);
        self
    }
}

struct PrefabEntry {
    words: u32,
    factory: ScriptFactory,
    callbacks: Rc<CallbackTable>,
}

/// All known prefabs; populated once before the first tick.
#[derive(Default)]
pub struct PrefabRegistry {
    entries: HashMap<PrefabId, PrefabEntry>,
}

impl PrefabRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: PrefabDef) {
        self.entries.insert(
            def.prefab,
            PrefabEntry {
                words: def.words,
                factory: def.factory,
                callbacks: Rc::new(def.callbacks),
            },
        );
    }

    #[must_use]
    pub fn contains(&self, prefab: PrefabId) -> bool {
        self.entries.contains_key(&prefab)
    }

    /// State block size of a prefab in words.
    ///
    /// # Panics
    /// Panics on an unregistered prefab; spawning an unknown type is a
    /// programming error.
    #[must_use]
    pub fn words(&self, prefab: PrefabId) -> u32 {
        self.entry(prefab).words
    }

    #[must_use]
    pub fn callbacks(&self, prefab: PrefabId) -> Rc<CallbackTable> {
        Rc::clone(&self.entry(prefab).callbacks)
    }

    #[must_use]
    pub fn instantiate(&self, prefab: PrefabId) -> Vec<Box<dyn NetworkScript>> {
        (self.entry(prefab).factory)()
    }

    fn entry(&self, prefab: PrefabId) -> &PrefabEntry {
        self.entries
            .get(&prefab)
            .unwrap_or_else(|| panic!("unregistered prefab {prefab:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl NetworkScript for Noop {}

    #[test]
    fn test_ref_sentinels() {
        assert!(!EntityRef::INVALID.is_valid());
        assert!(EntityRef(0).is_valid());
        assert!(!ConnectionId::NONE.is_valid());
    }

    #[test]
    fn test_registry_round_trip() {
        let mut reg = PrefabRegistry::new();
        reg.register(PrefabDef::new(PrefabId(3), 8, || vec![Box::new(Noop)]));

        assert!(reg.contains(PrefabId(3)));
        assert!(!reg.contains(PrefabId(4)));
        assert_eq!(reg.words(PrefabId(3)), 8);
        assert_eq!(reg.instantiate(PrefabId(3)).len(), 1);
    }

    #[test]
    #[should_panic(expected = "unregistered prefab")]
    fn test_unknown_prefab_panics() {
        let reg = PrefabRegistry::new();
        let _ = reg.words(PrefabId(9));
    }
}
