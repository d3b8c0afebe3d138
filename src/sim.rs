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

//! Simulation core shared by server and client
//!
//! Owns the live entity table, the snapshot ring, the input pool and
//! the prefab registry, and drives script hooks over the current
//! snapshot. Lifecycle is staged: entities spawned during a tick enter
//! the live list only after that tick's send, and destroyed entities
//! keep their final state replicating through the tick that removed
//! them.
//!
//! Everything here runs on one thread. The borrow discipline for
//! script invocation is to split an entity into its script list and its
//! bookkeeping before building the `ScriptCtx`, so scripts mutate the
//! snapshot while the core keeps the table.

use crate::config::ReplicaConfig;
use crate::entity::{
    ConnectionId, Entity, EntityRef, PrefabDef, PrefabId, PrefabRegistry, ScriptCtx, SimCommand,
};
use crate::input::{InputId, InputPool};
use crate::snapshot::EntityMeta;
use crate::state::ChangeNotice;
use crate::tick::Tick;
use crate::world::WorldState;
use crate::{ReplicaError, Result};
use std::collections::HashMap;

/// Which script hook a fixed pass invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPhase {
    FixedUpdate,
    Update,
    Render,
}

pub struct SimulationCore {
    pub config: ReplicaConfig,
    pub world: WorldState,
    pub registry: PrefabRegistry,
    pub inputs: InputPool,
    /// Whether this core assigns entity references. Replicas adopt
    /// server-assigned references instead, so script-staged spawns are
    /// ignored on them rather than minting colliding refs.
    pub authority: bool,
    entities: Vec<Option<Entity>>,
    live: Vec<u16>,
    pending_add: Vec<u16>,
    pending_remove: Vec<u16>,
    commands: Vec<SimCommand>,
    notices: Vec<ChangeNotice>,
    next_ref: i32,
}

impl SimulationCore {
    #[must_use]
    pub fn new(config: ReplicaConfig) -> Self {
        let world = WorldState::new(&config);
        let inputs = InputPool::new(config.input_pool_size(), config.input_types);
        let entities = (0..config.max_entities).map(|_| None).collect();
        Self {
            config,
            world,
            registry: PrefabRegistry::new(),
            inputs,
            authority: true,
            entities,
            live: Vec::new(),
            pending_add: Vec::new(),
            pending_remove: Vec::new(),
            commands: Vec::new(),
            notices: Vec::new(),
            next_ref: 0,
        }
    }

    pub fn register_prefab(&mut self, def: PrefabDef) {
        self.registry.register(def);
    }

    // ========================================================================
    // Entity lifecycle
    // ========================================================================

    /// Spawn with a freshly assigned entity reference (authority side).
    /// The entity replicates this tick and goes live after the send.
    pub fn spawn(&mut self, prefab: PrefabId, owner: ConnectionId) -> Result<u16> {
        let meta_id = self
            .free_meta_slot()
            .ok_or(ReplicaError::EntityCapacity(self.entities.len()))?;
        let entity_ref = EntityRef(self.next_ref);
        self.next_ref += 1;
        self.spawn_at(meta_id, entity_ref, prefab, owner)?;
        Ok(meta_id)
    }

    /// Spawn into a known slot with a known reference (replica side, or
    /// authority internals). Adopts existing state blocks when the slot
    /// was already announced.
    pub fn spawn_at(
        &mut self,
        meta_id: u16,
        entity_ref: EntityRef,
        prefab: PrefabId,
        owner: ConnectionId,
    ) -> Result<()> {
        assert!(
            self.entities[meta_id as usize].is_none(),
            "meta slot {meta_id} already occupied"
        );
        let words = self.registry.words(prefab);
        let meta = EntityMeta {
            entity_ref,
            prefab,
            input_source: owner,
            destroyed: false,
        };
        let slot = self.world.current.adopt_entity(meta_id, meta, words)?;
        self.entities[meta_id as usize] = Some(Entity {
            entity_ref,
            meta_id,
            prefab,
            input_source: owner,
            slot,
            dirty: true,
            external: None,
            started: false,
            scripts: self.registry.instantiate(prefab),
            callbacks: self.registry.callbacks(prefab),
        });
        self.pending_add.push(meta_id);
        Ok(())
    }

    /// Stage removal. The entity's final state and its destroyed flag
    /// still replicate this tick; memory is released by `commit_pending`.
    pub fn destroy(&mut self, entity: EntityRef) -> bool {
        let Some(meta_id) = self.find_by_ref(entity) else {
            log::warn!("destroy of unknown entity {entity:?}");
            return false;
        };
        if self.pending_remove.contains(&meta_id) {
            return true;
        }
        self.world.current.mark_destroyed(meta_id);
        self.pending_remove.push(meta_id);
        true
    }

    #[must_use]
    pub fn find_by_ref(&self, entity: EntityRef) -> Option<u16> {
        self.entities
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.entity_ref == entity))
            .map(|i| i as u16)
    }

    #[must_use]
    pub fn entity(&self, meta_id: u16) -> Option<&Entity> {
        self.entities.get(meta_id as usize).and_then(Option::as_ref)
    }

    pub fn entity_mut(&mut self, meta_id: u16) -> Option<&mut Entity> {
        self.entities
            .get_mut(meta_id as usize)
            .and_then(Option::as_mut)
    }

    #[must_use]
    pub fn live(&self) -> &[u16] {
        &self.live
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Meta slots replicating this tick: the live list plus spawns
    /// staged during it (their first snapshot goes out before they run).
    #[must_use]
    pub fn replicating(&self) -> Vec<u16> {
        let mut ids = self.live.clone();
        ids.extend_from_slice(&self.pending_add);
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn free_meta_slot(&self) -> Option<u16> {
        self.entities
            .iter()
            .enumerate()
            .find(|(i, e)| e.is_none() && !self.world.current.meta(*i as u16).is_valid())
            .map(|(i, _)| i as u16)
    }

    /// Promote staged spawns to live and release staged removals.
    /// Called after the tick's snapshot went out. Returns the removed
    /// entities so the caller can despawn host objects.
    pub fn commit_pending(&mut self) -> Vec<Entity> {
        for meta_id in std::mem::take(&mut self.pending_add) {
            // a same-tick spawn+destroy never goes live
            if self.entities[meta_id as usize].is_some()
                && !self.pending_remove.contains(&meta_id)
            {
                self.live.push(meta_id);
            }
        }
        self.live.sort_unstable();

        let mut removed = Vec::new();
        for meta_id in std::mem::take(&mut self.pending_remove) {
            self.live.retain(|&m| m != meta_id);
            if let Some(mut entity) = self.entities[meta_id as usize].take() {
                self.invoke_on_destroy(&mut entity);
                removed.push(entity);
            }
            self.world.current.free_entity(meta_id);
        }
        removed
    }

    fn invoke_on_destroy(&mut self, entity: &mut Entity) {
        let mut dirty = entity.dirty;
        let mut ctx = ScriptCtx {
            snapshot: &mut self.world.current,
            tick: self.world.from_tick,
            input: None,
            resimulating: false,
            commands: &mut self.commands,
            meta_id: entity.meta_id,
            entity_ref: entity.entity_ref,
            dirty: &mut dirty,
            notices: &mut self.notices,
        };
        for script in &mut entity.scripts {
            script.on_destroy(&mut ctx);
        }
        entity.dirty = dirty;
    }

    // ========================================================================
    // Tick driving
    // ========================================================================

    /// Archive the previous tick's result and open `tick` for writes.
    pub fn begin_tick(&mut self, tick: Tick) {
        self.world.begin_tick(tick);
        for &meta_id in &self.live {
            if let Some(entity) = self.entities[meta_id as usize].as_mut() {
                entity.dirty = false;
            }
        }
        // removals staged between ticks must survive the dirty reset
        // so their destroyed flag replicates this tick
        for i in 0..self.pending_remove.len() {
            self.world.current.mark_destroyed(self.pending_remove[i]);
        }
    }

    /// Run one fixed pass over every live entity: `on_start` on the
    /// first tick an entity is live, then `on_fixed_update`, then
    /// `serialize`. Change notices fire after the pass, staged commands
    /// are processed last.
    pub fn run_fixed(
        &mut self,
        tick: Tick,
        resimulating: bool,
        inputs_by_conn: &HashMap<ConnectionId, InputId>,
    ) {
        for i in 0..self.live.len() {
            let meta_id = self.live[i];
            let Some(mut entity) = self.entities[meta_id as usize].take() else {
                continue;
            };
            let input = inputs_by_conn
                .get(&entity.input_source)
                .map(|&id| self.inputs.get(id));
            let first_tick = !entity.started;
            entity.started = true;

            let mut dirty = entity.dirty;
            {
                let mut ctx = ScriptCtx {
                    snapshot: &mut self.world.current,
                    tick,
                    input,
                    resimulating,
                    commands: &mut self.commands,
                    meta_id,
                    entity_ref: entity.entity_ref,
                    dirty: &mut dirty,
                    notices: &mut self.notices,
                };
                for script in &mut entity.scripts {
                    if first_tick {
                        script.on_start(&mut ctx);
                    }
                    script.on_fixed_update(&mut ctx);
                }
                for script in &mut entity.scripts {
                    script.serialize(&mut ctx);
                }
            }
            entity.dirty = dirty;
            self.entities[meta_id as usize] = Some(entity);
        }

        if resimulating {
            // replay ticks stay silent; the reconciliation pass diffs
            // the final state and fires each changed word once
            self.notices.clear();
        } else {
            self.dispatch_notices();
        }
        self.process_commands();
    }

    /// Run a frame pass (`on_update` or `on_render`); never runs during
    /// resimulation.
    pub fn run_frame(&mut self, tick: Tick, phase: ScriptPhase) {
        debug_assert_ne!(phase, ScriptPhase::FixedUpdate);
        for i in 0..self.live.len() {
            let meta_id = self.live[i];
            let Some(mut entity) = self.entities[meta_id as usize].take() else {
                continue;
            };
            let mut dirty = entity.dirty;
            {
                let mut ctx = ScriptCtx {
                    snapshot: &mut self.world.current,
                    tick,
                    input: None,
                    resimulating: false,
                    commands: &mut self.commands,
                    meta_id,
                    entity_ref: entity.entity_ref,
                    dirty: &mut dirty,
                    notices: &mut self.notices,
                };
                for script in &mut entity.scripts {
                    match phase {
                        ScriptPhase::Update => script.on_update(&mut ctx),
                        ScriptPhase::Render => script.on_render(&mut ctx),
                        ScriptPhase::FixedUpdate => unreachable!(),
                    }
                }
            }
            entity.dirty = dirty;
            self.entities[meta_id as usize] = Some(entity);
        }
        self.dispatch_notices();
        self.process_commands();
    }

    /// Reload script-local fields from the current snapshot after an
    /// authoritative restore.
    pub fn reload_scripts(&mut self, tick: Tick) {
        for i in 0..self.live.len() {
            let meta_id = self.live[i];
            let Some(mut entity) = self.entities[meta_id as usize].take() else {
                continue;
            };
            let mut dirty = entity.dirty;
            {
                let mut ctx = ScriptCtx {
                    snapshot: &mut self.world.current,
                    tick,
                    input: None,
                    resimulating: true,
                    commands: &mut self.commands,
                    meta_id,
                    entity_ref: entity.entity_ref,
                    dirty: &mut dirty,
                    notices: &mut self.notices,
                };
                for script in &mut entity.scripts {
                    script.deserialize(&mut ctx);
                }
            }
            entity.dirty = dirty;
            self.entities[meta_id as usize] = Some(entity);
        }
        // deserialize re-applies known values; notices from it are noise
        self.notices.clear();
    }

    /// Deliver one externally built notice to its entity's hook table.
    pub fn dispatch_notice(&self, notice: &ChangeNotice) {
        if let Some(entity) = self.entity(notice.meta_id) {
            entity.callbacks.dispatch(notice);
        }
    }

    fn dispatch_notices(&mut self) {
        let notices = std::mem::take(&mut self.notices);
        for notice in &notices {
            self.dispatch_notice(notice);
        }
    }

    fn process_commands(&mut self) {
        let commands = std::mem::take(&mut self.commands);
        for command in commands {
            match command {
                SimCommand::Spawn { prefab, owner } => {
                    if !self.authority {
                        log::warn!("ignoring script spawn of {prefab:?} on replica");
                        continue;
                    }
                    if let Err(err) = self.spawn(prefab, owner) {
                        log::error!("staged spawn of {prefab:?} failed: {err}");
                    }
                }
                SimCommand::Destroy { entity } => {
                    self.destroy(entity);
                }
            }
        }
    }
}

impl std::fmt::Debug for SimulationCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationCore")
            .field("tick", &self.world.from_tick)
            .field("live", &self.live.len())
            .field("pending_add", &self.pending_add.len())
            .field("pending_remove", &self.pending_remove.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NetworkScript;
    use crate::state::{word_to_i32, ChangeSource};
    use std::cell::RefCell;
    use std::rc::Rc;

    const COUNTER: u16 = 0;

    /// Increments word 0 every fixed tick; doubles the step when the
    /// owning connection sent input block 1.
    struct Counter;
    impl NetworkScript for Counter {
        fn on_fixed_update(&mut self, ctx: &mut ScriptCtx) {
            let step = if ctx.input.is_some_and(|i| i.block(1).is_some()) {
                2
            } else {
                1
            };
            let v = ctx.read_i32(COUNTER);
            ctx.write_i32(COUNTER, v + step);
        }
    }

    struct SpawnOnce {
        done: bool,
    }
    impl NetworkScript for SpawnOnce {
        fn on_fixed_update(&mut self, ctx: &mut ScriptCtx) {
            if !self.done {
                self.done = true;
                ctx.spawn(PrefabId(1), ConnectionId::NONE);
            }
        }
    }

    fn core() -> SimulationCore {
        let cfg = ReplicaConfig {
            max_entities: 8,
            state_words: 4,
            history_depth: 8,
            ..ReplicaConfig::default()
        };
        let mut core = SimulationCore::new(cfg);
        core.register_prefab(PrefabDef::new(PrefabId(1), 4, || vec![Box::new(Counter)]));
        core.register_prefab(PrefabDef::new(PrefabId(2), 4, || {
            vec![Box::new(SpawnOnce { done: false })]
        }));
        core.world.current.init(Tick(0));
        core
    }

    #[test]
    fn test_spawn_goes_live_after_commit() {
        let mut core = core();
        let meta_id = core.spawn(PrefabId(1), ConnectionId(0)).unwrap();
        assert!(core.live().is_empty());

        core.begin_tick(Tick(1));
        core.run_fixed(Tick(1), false, &HashMap::new());
        // not live yet: nothing ran
        assert_eq!(word_to_i32(core.world.current.read_word(meta_id, 0)), 0);

        core.commit_pending();
        assert_eq!(core.live(), &[meta_id]);
        core.begin_tick(Tick(2));
        core.run_fixed(Tick(2), false, &HashMap::new());
        assert_eq!(word_to_i32(core.world.current.read_word(meta_id, 0)), 1);
    }

    #[test]
    fn test_input_reaches_owned_entity() {
        let mut core = core();
        let meta_id = core.spawn(PrefabId(1), ConnectionId(3)).unwrap();
        core.commit_pending();

        let id = core.inputs.create().unwrap();
        let input = core.inputs.get_mut(id);
        input.target_tick = Tick(1);
        input.push_block(1, &[1]);

        let mut by_conn = HashMap::new();
        by_conn.insert(ConnectionId(3), id);
        core.begin_tick(Tick(1));
        core.run_fixed(Tick(1), false, &by_conn);
        core.inputs.recycle(id);
        // doubled step for the tick that carried input
        assert_eq!(word_to_i32(core.world.current.read_word(meta_id, 0)), 2);
    }

    #[test]
    fn test_destroy_keeps_final_state_until_commit() {
        let mut core = core();
        let meta_id = core.spawn(PrefabId(1), ConnectionId::NONE).unwrap();
        core.commit_pending();
        core.begin_tick(Tick(1));
        core.run_fixed(Tick(1), false, &HashMap::new());

        let entity_ref = core.entity(meta_id).unwrap().entity_ref;
        assert!(core.destroy(entity_ref));
        // destroyed flag is replicated, memory still allocated
        assert!(core.world.current.meta(meta_id).destroyed);
        assert!(core.world.current.slot(meta_id).is_valid());

        let removed = core.commit_pending();
        assert_eq!(removed.len(), 1);
        assert!(core.live().is_empty());
        assert!(!core.world.current.slot(meta_id).is_valid());
    }

    #[test]
    fn test_staged_spawn_from_script() {
        let mut core = core();
        core.spawn(PrefabId(2), ConnectionId::NONE).unwrap();
        core.commit_pending();

        core.begin_tick(Tick(1));
        core.run_fixed(Tick(1), false, &HashMap::new());
        // script-staged child exists in the snapshot but is not live yet
        assert_eq!(core.live_count(), 1);
        core.commit_pending();
        assert_eq!(core.live_count(), 2);
    }

    #[test]
    fn test_replica_ignores_script_spawn() {
        let mut core = core();
        core.authority = false;
        core.spawn(PrefabId(2), ConnectionId::NONE).unwrap();
        core.commit_pending();

        core.begin_tick(Tick(1));
        core.run_fixed(Tick(1), false, &HashMap::new());
        core.commit_pending();
        // the staged child would mint a colliding reference; replicas
        // only spawn what the authority announces
        assert_eq!(core.live_count(), 1);
    }

    #[test]
    fn test_change_hooks_fire_once_per_transition() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&fired);

        let mut core = core();
        core.register_prefab(
            PrefabDef::new(PrefabId(5), 4, || vec![Box::new(Counter)]).with_hook(
                COUNTER,
                false,
                move |n| sink.borrow_mut().push((n.source, n.new)),
            ),
        );
        let meta_id = core.spawn(PrefabId(5), ConnectionId::NONE).unwrap();
        core.commit_pending();

        core.begin_tick(Tick(1));
        core.run_fixed(Tick(1), false, &HashMap::new());
        core.begin_tick(Tick(2));
        core.run_fixed(Tick(2), false, &HashMap::new());
        assert_eq!(
            fired.borrow().as_slice(),
            &[
                (ChangeSource::Predicted, 1),
                (ChangeSource::Predicted, 2)
            ]
        );
        let _ = meta_id;
    }
}
