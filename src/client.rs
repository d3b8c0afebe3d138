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

//! Predicted client simulation
//!
//! The client runs the same scripts as the server, a few ticks ahead,
//! against its own snapshot ring. Every received authoritative snapshot
//! triggers reconciliation: confirmed inputs are retired, the
//! authoritative state is word-diffed against the prediction (firing
//! `Authoritative` change notices), scripts reload their fields, and
//! the surviving inputs replay one tick each. The net effect of the
//! replay is diffed once more and fires `Resimulated` notices, at most
//! one notice per word per reconciliation.
//!
//! Outgoing datagrams are addressed with the local connection id; a
//! real transport maps that id to its server socket.

use crate::clock::{DriftController, TickClock};
use crate::config::ReplicaConfig;
use crate::engine_bridge::Transport;
use crate::entity::{ConnectionId, PrefabDef};
use crate::input::InputId;
use crate::interp::{BlendView, RemoteInterpolation};
use crate::sim::SimulationCore;
use crate::snapshot::{EntityMeta, Snapshot};
use crate::state::{ChangeNotice, ChangeSource};
use crate::tick::Tick;
use crate::wire::{
    decode_snapshot, BandwidthStats, FragmentBuffer, InputPacket, SnapshotPayload, WireInput,
    WireInputBlock,
};
use crate::{ReplicaError, Result};
use std::collections::{HashMap, HashSet};

pub struct ClientSimulation {
    pub core: SimulationCore,
    pub clock: TickClock,
    pub drift: DriftController,
    pub remote: RemoteInterpolation,
    pub stats: BandwidthStats,
    connection: ConnectionId,
    fragments: FragmentBuffer,
    /// Last applied authoritative world, stamped with its author tick.
    auth: Snapshot,
    auth_tick: Tick,
    /// Deep-copy staging for ring restores and prediction diffs.
    scratch: Snapshot,
    previous: Snapshot,
    /// Inputs sent but not yet folded into an authoritative snapshot,
    /// oldest first.
    unacked: Vec<InputId>,
    /// Input blocks staged by the host for the next predicted tick.
    staged_blocks: Vec<(i16, Vec<u8>)>,
    lost_since_send: bool,
    /// `interPacketDeltaTime` echoed by the server, for diagnostics.
    pub server_packet_delta: f64,
}

impl ClientSimulation {
    #[must_use]
    pub fn new(config: ReplicaConfig, connection: ConnectionId) -> Self {
        let clock = TickClock::new(&config);
        let drift = DriftController::new(&config);
        let remote = RemoteInterpolation::new(&config);
        let mut auth = Snapshot::new(&config);
        auth.init(Tick::INVALID);
        let mut scratch = Snapshot::new(&config);
        scratch.init(Tick::INVALID);
        let mut previous = Snapshot::new(&config);
        previous.init(Tick::INVALID);
        let fragment_limit = config.max_snapshot_bytes();
        let mut core = SimulationCore::new(config);
        core.world.current.init(Tick::ZERO);
        core.authority = false;
        Self {
            core,
            clock,
            drift,
            remote,
            stats: BandwidthStats::default(),
            connection,
            fragments: FragmentBuffer::with_limit(fragment_limit),
            auth,
            auth_tick: Tick::INVALID,
            scratch,
            previous,
            unacked: Vec::new(),
            staged_blocks: Vec::new(),
            lost_since_send: false,
            server_packet_delta: 0.0,
        }
    }

    pub fn register_prefab(&mut self, def: PrefabDef) {
        self.core.register_prefab(def);
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    #[must_use]
    pub fn authoritative_tick(&self) -> Tick {
        self.auth_tick
    }

    #[must_use]
    pub fn predicted_tick(&self) -> Tick {
        self.clock.tick
    }

    // ========================================================================
    // Prediction loop
    // ========================================================================

    /// Stage one typed input block for the next predicted tick.
    pub fn queue_local_input(&mut self, type_id: i16, payload: &[u8]) {
        self.staged_blocks.push((type_id, payload.to_vec()));
    }

    /// Feed wall time: steers the clock, runs the predicted ticks it
    /// covers (sending one input packet per tick), and advances remote
    /// playback.
    pub fn advance(&mut self, delta_seconds: f64, transport: &mut dyn Transport) {
        self.drift.steer(&mut self.clock, self.auth_tick);
        let base = self.clock.tick;
        let steps = self.clock.advance(delta_seconds);
        for i in 0..steps {
            self.predict_tick(base + (i + 1) as i32, transport);
        }
        self.remote.advance(delta_seconds);
    }

    /// Run exactly one predicted tick and send its input.
    pub fn predict_tick(&mut self, tick: Tick, transport: &mut dyn Transport) {
        self.clock.tick = tick;
        self.core.begin_tick(tick);

        let mut by_conn = HashMap::new();
        if let Some(id) = self.author_input(tick) {
            by_conn.insert(self.connection, id);
        }
        self.core.run_fixed(tick, false, &by_conn);

        self.send_inputs(transport);
        self.core.commit_pending();
    }

    /// Build this tick's input from the staged blocks and append it to
    /// the unacked window. A saturated window retires its oldest entry.
    fn author_input(&mut self, tick: Tick) -> Option<InputId> {
        let id = match self.core.inputs.create() {
            Some(id) => id,
            None => {
                let oldest = if self.unacked.is_empty() {
                    return None;
                } else {
                    self.unacked.remove(0)
                };
                log::warn!("prediction window saturated, retiring oldest unacked input");
                self.core.inputs.recycle(oldest);
                self.core.inputs.create()?
            }
        };
        let remote_from = self
            .remote
            .position()
            .map_or(Tick::INVALID, |(from, _)| from);
        let alpha = self.clock.alpha();
        let input = self.core.inputs.get_mut(id);
        input.target_tick = tick;
        input.author_tick = tick;
        input.alpha = alpha;
        input.remote_from_tick = remote_from;
        for (type_id, payload) in self.staged_blocks.drain(..) {
            input.push_block(type_id, &payload);
        }
        self.unacked.push(id);
        Some(id)
    }

    /// Send every unacked input plus the snapshot ack. Redundant
    /// resends ride for free until the server confirms them.
    fn send_inputs(&mut self, transport: &mut dyn Transport) {
        let packet = InputPacket {
            lost_packet: self.lost_since_send,
            last_author_tick: self.auth_tick,
            inputs: self
                .unacked
                .iter()
                .map(|&id| {
                    let input = self.core.inputs.get(id);
                    WireInput {
                        author_tick: input.author_tick,
                        target_tick: input.target_tick,
                        alpha: input.alpha,
                        remote_from_tick: input.remote_from_tick,
                        blocks: input
                            .blocks()
                            .iter()
                            .map(|b| WireInputBlock {
                                type_id: b.type_id,
                                payload: b.payload.clone(),
                            })
                            .collect(),
                    }
                })
                .collect(),
        };
        self.lost_since_send = false;
        let bytes = packet.to_compact_bytes();
        self.stats.record_send_raw(bytes.len());
        transport.send(self.connection, &bytes);
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Ingest one server datagram. Returns `true` when a complete
    /// snapshot was reassembled and applied.
    ///
    /// # Errors
    /// `MalformedPacket` on datagrams that do not parse; state is
    /// untouched.
    pub fn receive_datagram(&mut self, datagram: &[u8]) -> Result<bool> {
        self.stats.record_receive(datagram.len());
        let Some((tick, payload)) = self.fragments.push(datagram)? else {
            return Ok(false);
        };
        let payload = decode_snapshot(tick, &payload)?;
        if !self.acceptable(&payload) {
            log::debug!(
                "dropping snapshot {} ({}), authoritative is {}",
                payload.author_tick,
                if payload.header.is_full {
                    "full"
                } else if payload.header.is_multi {
                    "multi"
                } else {
                    "delta"
                },
                self.auth_tick
            );
            self.lost_since_send = true;
            return Ok(false);
        }
        self.apply_payload(&payload)?;
        self.reconcile();
        Ok(true)
    }

    /// A full snapshot stands alone; a delta only applies to the exact
    /// snapshot it was diffed against; a multi-tick packet covers the
    /// whole gap back to our own ack, so any applied base suffices.
    fn acceptable(&self, payload: &SnapshotPayload) -> bool {
        if payload.author_tick <= self.auth_tick {
            return false;
        }
        if payload.header.is_full {
            return true;
        }
        if payload.header.is_multi {
            return self.auth_tick.is_valid();
        }
        payload.author_tick == self.auth_tick.next()
    }

    /// Every record is validated before the first write to `auth`, so a
    /// malformed packet never leaves a half-applied snapshot behind.
    fn validate_payload(&self, payload: &SnapshotPayload) -> Result<()> {
        let mut announced: HashMap<u16, u32> = HashMap::with_capacity(payload.metas.len());
        for meta in &payload.metas {
            if usize::from(meta.meta_id) >= self.auth.max_entities() {
                return Err(ReplicaError::MalformedPacket("meta id out of range"));
            }
            if !meta.destroyed {
                if !self.core.registry.contains(meta.prefab) {
                    return Err(ReplicaError::MalformedPacket("unknown prefab"));
                }
                announced.insert(meta.meta_id, self.core.registry.words(meta.prefab));
            }
        }
        for record in &payload.states {
            let words = announced.get(&record.meta_id).copied().or_else(|| {
                let known = usize::from(record.meta_id) < self.auth.max_entities()
                    && self.auth.slot(record.meta_id).is_valid();
                known.then(|| self.auth.slot(record.meta_id).words)
            });
            let Some(words) = words else {
                return Err(ReplicaError::MalformedPacket("state for unknown entity"));
            };
            if record.words.iter().any(|&(w, _)| u32::from(w) >= words) {
                return Err(ReplicaError::MalformedPacket("state word out of range"));
            }
        }
        Ok(())
    }

    fn apply_payload(&mut self, payload: &SnapshotPayload) -> Result<()> {
        self.validate_payload(payload)?;
        self.server_packet_delta = payload.header.inter_packet_delta;

        // destroys are deferred until after state application so a
        // destroyed entity's final words still land before it unloads
        let mut destroyed: Vec<(u16, crate::entity::EntityRef)> = Vec::new();
        let mut listed: HashSet<u16> = HashSet::with_capacity(payload.metas.len());
        for meta in &payload.metas {
            listed.insert(meta.meta_id);
            if meta.destroyed {
                destroyed.push((meta.meta_id, meta.entity_ref));
                continue;
            }
            let words = self.core.registry.words(meta.prefab);
            let entry = EntityMeta {
                entity_ref: meta.entity_ref,
                prefab: meta.prefab,
                input_source: meta.input_source,
                destroyed: false,
            };
            // a reused slot means the old entity is gone
            let reused = self
                .core
                .entity(meta.meta_id)
                .is_some_and(|e| e.entity_ref != meta.entity_ref);
            if reused {
                self.despawn_local(meta.meta_id);
            }
            self.auth.adopt_entity(meta.meta_id, entry, words)?;
            if self.core.entity(meta.meta_id).is_none() {
                self.core
                    .spawn_at(meta.meta_id, meta.entity_ref, meta.prefab, meta.input_source)?;
            }
        }

        if payload.header.is_full {
            // anything we know that the full view omits is gone or out
            // of interest; either way it unloads
            let known: Vec<u16> = self
                .core
                .world
                .current
                .live_metas()
                .map(|(id, _)| id)
                .collect();
            for meta_id in known {
                if !listed.contains(&meta_id) {
                    self.despawn_local(meta_id);
                }
            }
        }

        for record in &payload.states {
            if !self.auth.slot(record.meta_id).is_valid() {
                continue;
            }
            for &(word, value) in &record.words {
                self.auth.overwrite_word(record.meta_id, word, value);
            }
        }

        for (meta_id, entity_ref) in destroyed {
            // a removal resent redundantly must not hit the slot's new
            // occupant
            let recycled = self
                .core
                .entity(meta_id)
                .is_some_and(|e| e.entity_ref != entity_ref);
            if !recycled {
                self.despawn_local(meta_id);
            }
        }

        self.auth.tick = payload.author_tick;
        self.auth_tick = payload.author_tick;
        self.remote.observe(payload.author_tick);

        // tick-count RTT from our echoed author tick
        if payload.header.last_acked_client_tick.is_valid() {
            let ticks = (self.clock.tick - payload.header.last_acked_client_tick).max(0);
            self.drift
                .observe_rtt(f64::from(ticks) * self.core.config.tick_duration());
        }
        self.core.commit_pending();
        Ok(())
    }

    /// Remove an entity everywhere: live table, predicted world and the
    /// authoritative snapshot.
    fn despawn_local(&mut self, meta_id: u16) {
        if let Some(entity) = self.core.entity(meta_id) {
            let entity_ref = entity.entity_ref;
            self.core.destroy(entity_ref);
        }
        self.core.commit_pending();
        self.auth.free_entity(meta_id);
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Roll the predicted world back onto the authoritative snapshot
    /// and replay the unconfirmed inputs.
    fn reconcile(&mut self) {
        // the predicted front is the last tick actually simulated, not
        // the clock (which the host may not have advanced yet)
        let predicted = self.core.world.from_tick;
        let delay = predicted - self.auth_tick;

        // retire inputs the snapshot already incorporates
        let auth_tick = self.auth_tick;
        let mut retired = Vec::new();
        self.unacked.retain(|&id| {
            if self.core.inputs.get(id).target_tick <= auth_tick {
                retired.push(id);
                false
            } else {
                true
            }
        });
        for id in retired {
            self.core.inputs.recycle(id);
        }

        if delay >= self.core.config.max_predicted_ticks as i32 {
            // too far gone: drop the whole prediction and restart
            log::warn!(
                "prediction fell {delay} ticks behind authority, discarding window"
            );
            for id in self.unacked.drain(..) {
                self.core.inputs.recycle(id);
            }
            self.restore_authoritative();
            self.core.reload_scripts(self.auth_tick);
            self.clock
                .snap_to(self.auth_tick + self.drift.target_lead());
            self.remote.reset();
            self.remote.observe(self.auth_tick);
            return;
        }

        // snapshot the prediction so both diffs have a baseline
        self.core.world.current.copy_to(&mut self.previous);

        self.restore_authoritative();

        // authoritative pass: every word the rollback changed fires once
        let mut fired: HashSet<(u16, u16)> = HashSet::new();
        let notices = self.rollback_notices(ChangeSource::Authoritative, &fired);
        for notice in &notices {
            fired.insert((notice.meta_id, notice.word));
            self.core.dispatch_notice(notice);
        }

        self.core.reload_scripts(self.auth_tick);

        // replay: input targeting t drives the re-simulation of tick t
        let mut by_target: HashMap<Tick, InputId> = HashMap::new();
        for &id in &self.unacked {
            by_target.insert(self.core.inputs.get(id).target_tick, id);
        }
        for t in (self.auth_tick.0 + 1)..=predicted.0 {
            let tick = Tick(t);
            self.core.begin_tick(tick);
            let mut by_conn = HashMap::new();
            if let Some(&id) = by_target.get(&tick) {
                by_conn.insert(self.connection, id);
            }
            self.core.run_fixed(tick, true, &by_conn);
            self.core.commit_pending();
        }

        // resimulated pass: net replay effect, skipping fired words
        let notices = self.rollback_notices(ChangeSource::Resimulated, &fired);
        for notice in &notices {
            self.core.dispatch_notice(notice);
        }

        // a clock behind authority can never predict; jump it ahead
        if self.clock.tick < self.auth_tick {
            self.clock
                .snap_to(self.auth_tick + self.drift.target_lead());
        }
    }

    /// Overwrite the ring front and current with the authoritative
    /// snapshot, stamped as the start of the first replayed tick.
    fn restore_authoritative(&mut self) {
        self.auth.copy_to(&mut self.scratch);
        self.scratch.tick = self.auth_tick.next();
        self.core.world.restore_from(&self.scratch);
    }

    /// Word-diff `current` against the captured prediction; one notice
    /// per changed word not already in `fired`.
    fn rollback_notices(
        &self,
        source: ChangeSource,
        fired: &HashSet<(u16, u16)>,
    ) -> Vec<ChangeNotice> {
        let current = &self.core.world.current;
        let mut out = Vec::new();
        for (meta_id, meta) in current.live_metas() {
            if !current.slot(meta_id).is_valid()
                || !self.previous.slot(meta_id).is_valid()
                || self.previous.meta(meta_id).entity_ref != meta.entity_ref
            {
                continue;
            }
            let new_words = current.state_words(meta_id);
            let old_words = self.previous.state_words(meta_id);
            for (word, (&old, &new)) in old_words.iter().zip(new_words).enumerate() {
                let word = word as u16;
                if old != new && !fired.contains(&(meta_id, word)) {
                    out.push(ChangeNotice {
                        entity: meta.entity_ref,
                        meta_id,
                        word,
                        old,
                        new,
                        source,
                    });
                }
            }
        }
        out
    }

    // ========================================================================
    // Rendering
    // ========================================================================

    /// Blend view for locally predicted entities at the clock's alpha.
    #[must_use]
    pub fn local_view(&self) -> BlendView<'_> {
        BlendView::local(&self.core.world, self.clock.alpha())
    }

    /// Delayed blend view for remotely owned entities, if playback has
    /// started and the ring still brackets the playback cursor.
    #[must_use]
    pub fn remote_view(&self) -> Option<BlendView<'_>> {
        self.remote.sample(&self.core.world)
    }
}

impl std::fmt::Debug for ClientSimulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSimulation")
            .field("connection", &self.connection)
            .field("predicted", &self.clock.tick)
            .field("authoritative", &self.auth_tick)
            .field("unacked", &self.unacked.len())
            .finish_non_exhaustive()
    }
}
