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

//! Authoritative server simulation
//!
//! One fixed tick: archive the previous result, consume each
//! connection's queued input for this tick, run scripts, step physics,
//! rebuild the interest grid, then encode one snapshot per connection
//! (full, delta or multi-tick catch-up, chosen per peer) and hand the
//! fragments to the transport. Staged spawns and destroys commit only
//! after the send so a destroyed entity's final state still replicates.

use crate::clock::TickClock;
use crate::config::ReplicaConfig;
use crate::engine_bridge::{PhysicsRaycaster, PhysicsStepper, Transport, TransformSource};
use crate::entity::{ConnectionId, EntityRef, PrefabDef, PrefabId};
use crate::input::{ClientData, InputId};
use crate::interest::{cell_of, ConnectionInterest, InterestGrid, PendingRemoval};
use crate::sim::SimulationCore;
use crate::tick::Tick;
use crate::wire::{
    choose_mode, encode_snapshot, fragment_payload, BandwidthStats, InputPacket, PacketMode,
    PayloadHeader,
};
use crate::{ReplicaError, Result};
use std::collections::HashMap;

/// Per-connection replication state.
pub struct ServerConnection {
    pub data: ClientData,
    pub interest: ConnectionInterest,
    pub stats: BandwidthStats,
    /// Meta slot of the entity this connection owns, if any; its cell
    /// is the interest focus unless `interest.focus_override` is set.
    pub owned: Option<u16>,
    /// Last author tick seen in any input from this client; echoed in
    /// every snapshot header for the client's RTT estimate.
    last_author_tick: Tick,
    /// Remote-view base and alpha from the newest consumed input, kept
    /// for lag-compensated casts.
    last_remote_from: Tick,
    last_alpha: f32,
    last_packet_at: Option<f64>,
}

impl ServerConnection {
    fn new(connection: ConnectionId, cfg: &ReplicaConfig) -> Self {
        Self {
            data: ClientData::new(connection, cfg.max_queued_inputs),
            interest: ConnectionInterest::new(cfg),
            stats: BandwidthStats::default(),
            owned: None,
            last_author_tick: Tick::INVALID,
            last_remote_from: Tick::INVALID,
            last_alpha: 0.0,
            last_packet_at: None,
        }
    }
}

pub struct ServerSimulation {
    pub core: SimulationCore,
    pub clock: TickClock,
    grid: InterestGrid,
    connections: HashMap<ConnectionId, ServerConnection>,
    /// Wall-clock seconds fed through `advance`, for packet deltas.
    elapsed: f64,
}

impl ServerSimulation {
    #[must_use]
    pub fn new(config: ReplicaConfig) -> Self {
        let clock = TickClock::new(&config);
        let grid = InterestGrid::new(&config);
        let mut core = SimulationCore::new(config);
        core.world.current.init(Tick::ZERO);
        Self {
            core,
            clock,
            grid,
            connections: HashMap::new(),
            elapsed: 0.0,
        }
    }

    pub fn register_prefab(&mut self, def: PrefabDef) {
        self.core.register_prefab(def);
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub fn add_connection(&mut self, connection: ConnectionId) {
        self.connections
            .entry(connection)
            .or_insert_with(|| ServerConnection::new(connection, &self.core.config));
    }

    pub fn remove_connection(&mut self, connection: ConnectionId) {
        if let Some(mut conn) = self.connections.remove(&connection) {
            conn.data.drain(&mut self.core.inputs);
        }
    }

    pub fn connection(&self, connection: ConnectionId) -> Option<&ServerConnection> {
        self.connections.get(&connection)
    }

    pub fn connection_mut(&mut self, connection: ConnectionId) -> Option<&mut ServerConnection> {
        self.connections.get_mut(&connection)
    }

    /// Spawn an entity owned (input-driven and focus-defining) by a
    /// connection. The owned entity is pinned into its own view.
    pub fn spawn_for(&mut self, connection: ConnectionId, prefab: PrefabId) -> Result<u16> {
        let meta_id = self.core.spawn(prefab, connection)?;
        let conn = self
            .connections
            .get_mut(&connection)
            .ok_or(ReplicaError::UnknownConnection(connection))?;
        conn.owned = Some(meta_id);
        conn.interest.always_sync(meta_id);
        Ok(meta_id)
    }

    pub fn spawn(&mut self, prefab: PrefabId) -> Result<u16> {
        self.core.spawn(prefab, ConnectionId::NONE)
    }

    pub fn destroy(&mut self, entity: EntityRef) -> bool {
        self.core.destroy(entity)
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Ingest one client datagram.
    ///
    /// # Errors
    /// `MalformedPacket` when the datagram does not decode; the
    /// connection state is untouched.
    pub fn receive_input_packet(&mut self, connection: ConnectionId, datagram: &[u8]) -> Result<()> {
        let packet = InputPacket::from_compact_bytes(datagram)
            .ok_or(ReplicaError::MalformedPacket("input packet"))?;
        let now = self.elapsed;
        let conn = self
            .connections
            .get_mut(&connection)
            .ok_or(ReplicaError::UnknownConnection(connection))?;
        conn.stats.record_receive(datagram.len());

        if let Some(last) = conn.last_packet_at {
            let delta = now - last;
            conn.data.inter_packet_delta += (delta - conn.data.inter_packet_delta) / 8.0;
        }
        conn.last_packet_at = Some(now);

        if packet.last_author_tick > conn.data.acked_tick {
            conn.data.acked_tick = packet.last_author_tick;
        }
        if packet.lost_packet {
            conn.data.needs_full = true;
        }

        for wire in &packet.inputs {
            if wire.author_tick > conn.last_author_tick {
                conn.last_author_tick = wire.author_tick;
            }
            // redundantly resent inputs fall to the sequence guard
            if wire.target_tick <= conn.data.last_target_tick {
                continue;
            }
            let Some(id) = self.core.inputs.create() else {
                log::warn!("input pool exhausted, dropping input from {connection:?}");
                break;
            };
            let input = self.core.inputs.get_mut(id);
            input.target_tick = wire.target_tick;
            input.author_tick = wire.author_tick;
            input.alpha = wire.alpha;
            input.remote_from_tick = wire.remote_from_tick;
            for block in &wire.blocks {
                input.push_block(block.type_id, &block.payload);
            }
            conn.data.accept(&mut self.core.inputs, id);
        }
        Ok(())
    }

    // ========================================================================
    // Tick loop
    // ========================================================================

    /// Feed wall time; runs as many fixed ticks as it covers.
    pub fn advance(
        &mut self,
        delta_seconds: f64,
        transforms: &dyn TransformSource,
        physics: &mut dyn PhysicsStepper,
        transport: &mut dyn Transport,
    ) {
        self.elapsed += delta_seconds;
        let base = self.clock.tick;
        let steps = self.clock.advance(delta_seconds);
        for i in 0..steps {
            self.step(base + (i + 1) as i32, transforms, physics, transport);
        }
    }

    /// Run exactly one authoritative tick.
    pub fn step(
        &mut self,
        tick: Tick,
        transforms: &dyn TransformSource,
        physics: &mut dyn PhysicsStepper,
        transport: &mut dyn Transport,
    ) {
        self.core.begin_tick(tick);

        // one input per connection may drive this tick
        let mut by_conn: HashMap<ConnectionId, InputId> = HashMap::new();
        for conn in self.connections.values_mut() {
            if let Some(id) = conn.data.take_for_tick(&mut self.core.inputs, tick) {
                let input = self.core.inputs.get(id);
                conn.last_remote_from = input.remote_from_tick;
                conn.last_alpha = input.alpha;
                by_conn.insert(conn.data.connection, id);
            }
        }

        self.core.run_fixed(tick, false, &by_conn);
        for id in by_conn.into_values() {
            self.core.inputs.recycle(id);
        }

        physics.step(self.core.config.tick_duration());

        self.replicate(transport, transforms);

        let removed = self.core.commit_pending();
        for entity in &removed {
            for conn in self.connections.values_mut() {
                conn.interest.forget(PendingRemoval {
                    meta_id: entity.meta_id,
                    entity_ref: entity.entity_ref,
                    prefab: entity.prefab,
                    input_source: entity.input_source,
                    destroyed_at: tick,
                });
                if conn.owned == Some(entity.meta_id) {
                    conn.owned = None;
                }
            }
        }
    }

    fn replicate(&mut self, transport: &mut dyn Transport, transforms: &dyn TransformSource) {
        let replicating = self.core.replicating();
        self.grid.rebuild(replicating.iter().map(|&meta_id| {
            let pos = self
                .core
                .entity(meta_id)
                .and_then(|e| transforms.position(e.entity_ref));
            (meta_id, pos)
        }));

        let tick = self.core.world.current.tick;
        for conn in self.connections.values_mut() {
            let focus = conn
                .interest
                .focus_override
                .map(|p| cell_of(p, self.grid.cell_size()))
                .or_else(|| conn.owned.and_then(|m| self.grid.cell(m)));
            conn.interest.update(&self.grid, focus, &replicating);
            conn.interest.prune_removals(conn.data.acked_tick);

            let mode = choose_mode(&self.core.world, conn.data.acked_tick, conn.data.needs_full);
            if mode == PacketMode::Full && !conn.data.needs_full {
                // ring could not cover the gap; peer must rebaseline
                log::debug!(
                    "conn {:?} fell behind the ring (acked {}), sending full",
                    conn.data.connection,
                    conn.data.acked_tick
                );
                conn.interest.reset_baseline();
                let focus = conn
                    .interest
                    .focus_override
                    .map(|p| cell_of(p, self.grid.cell_size()))
                    .or_else(|| conn.owned.and_then(|m| self.grid.cell(m)));
                conn.interest.update(&self.grid, focus, &replicating);
            }
            let header = PayloadHeader {
                last_acked_client_tick: conn.last_author_tick,
                last_client_target_tick: conn.data.last_target_tick,
                inter_packet_delta: conn.data.inter_packet_delta,
                is_multi: mode == PacketMode::MultiTick,
                is_full: mode == PacketMode::Full,
            };
            let payload = encode_snapshot(
                &self.core.world,
                &conn.interest,
                &header,
                mode,
                conn.data.acked_tick,
            );
            for fragment in
                fragment_payload(tick, &payload, self.core.config.max_payload_bytes)
            {
                conn.stats.record_send(mode, fragment.len());
                transport.send(conn.data.connection, &fragment);
            }
            if mode == PacketMode::Full {
                // a full view conveys removals by omission
                conn.interest.prune_removals(tick);
                conn.data.needs_full = false;
            }
        }
    }

    // ========================================================================
    // Lag compensation
    // ========================================================================

    /// Cast a ray in the world a shooter was actually looking at: the
    /// two historical snapshots bracketing the client's rendered remote
    /// view, blended by its reported alpha.
    ///
    /// Returns `None` when the client's view has already left the ring.
    pub fn lag_compensated_ray(
        &self,
        connection: ConnectionId,
        raycaster: &mut dyn PhysicsRaycaster,
        origin: [f32; 3],
        direction: [f32; 3],
        max_distance: f32,
    ) -> Option<EntityRef> {
        let conn = self.connections.get(&connection)?;
        if !conn.last_remote_from.is_valid() {
            return None;
        }
        // the result of tick t is stamped t+1 in the ring
        let from = self.core.world.history(conn.last_remote_from.next())?;
        let to = self
            .core
            .world
            .history(conn.last_remote_from.next().next())
            .unwrap_or(from);
        raycaster.raycast(from, to, conn.last_alpha, origin, direction, max_distance)
    }
}
