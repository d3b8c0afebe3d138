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

// Justified pedantic suppression for allocator/networking code:
// - inline_always: word access and handle checks on replication hot paths
// - cast_*: intentional narrowing in wire serialization and bitmap math
// - similar_names: fl/sl, dx/dy/dz standard in allocator and spatial code
// - module_name_repetitions: bridge traits mirror their module names
#![allow(
    clippy::inline_always,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::similar_names,
    clippy::module_name_repetitions
)]

//! # ALICE-Replica
//!
//! Tick-synchronous authoritative state replication for real-time
//! multiplayer simulations.
//!
//! > "The server owns the truth. The client predicts it."
//!
//! One server simulation advances the world on a fixed tick, keeps a
//! ring of block-allocated snapshots, and streams per-connection deltas
//! filtered by area of interest. Each client runs the same scripts a
//! few ticks ahead, reconciles every authoritative snapshot by rollback
//! and input replay, and renders remote entities on a delayed,
//! rate-adjusted timeline.
//!
//! ## Quick Start
//!
//! ```rust
//! use alice_replica::engine_bridge::null::{NullPhysics, QueueTransport};
//! use alice_replica::engine_bridge::TransformSource;
//! use alice_replica::{
//!     ConnectionId, EntityRef, NetworkScript, PrefabDef, PrefabId,
//!     ReplicaConfig, ScriptCtx, ServerSimulation, Tick,
//! };
//!
//! // One networked behavior: drift +0.1 on word 0 every tick
//! struct Mover;
//! impl NetworkScript for Mover {
//!     fn on_fixed_update(&mut self, ctx: &mut ScriptCtx) {
//!         let x = ctx.read_f32(0);
//!         ctx.write_f32(0, x + 0.1);
//!     }
//! }
//!
//! struct Origin;
//! impl TransformSource for Origin {
//!     fn position(&self, _e: EntityRef) -> Option<[f32; 3]> {
//!         Some([0.0; 3])
//!     }
//! }
//!
//! let mut server = ServerSimulation::new(ReplicaConfig::default());
//! server.register_prefab(PrefabDef::new(PrefabId(1), 4, || vec![Box::new(Mover)]));
//! server.add_connection(ConnectionId(0));
//! server.spawn_for(ConnectionId(0), PrefabId(1)).unwrap();
//!
//! // one authoritative tick → one snapshot on the wire
//! let mut transport = QueueTransport::default();
//! server.step(Tick(1), &Origin, &mut NullPhysics, &mut transport);
//! assert!(!transport.sent.is_empty());
//! ```
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`alloc`] | Two-level segregated-fit block allocator, O(1) malloc/free |
//! | [`config`] | Fixed-capacity engine configuration |
//! | [`tick`] | Signed tick counter and ring indexing |
//! | [`state`] | Word-packed entity state, dirty maps, change notices |
//! | [`snapshot`] | Point-in-time world capture: metadata + allocator |
//! | [`world`] | Tick-indexed snapshot ring |
//! | [`entity`] | Entities, `NetworkScript` capabilities, prefab registry |
//! | [`input`] | Pooled tick-targeted inputs, per-connection queues |
//! | [`sim`] | Shared script-driving simulation core |
//! | [`interest`] | Cell-grid area-of-interest filtering with hysteresis |
//! | [`wire`] | Full/delta/multi-tick payloads, fragmentation, input packets |
//! | [`server`] | Authoritative tick loop and per-connection replication |
//! | [`client`] | Prediction, rollback reconciliation and input replay |
//! | [`clock`] | Fixed-tick accumulator clock, drift steering, RTT |
//! | [`interp`] | Local alpha blending, delayed remote playback |
//! | [`engine_bridge`] | Host traits: spawner, transforms, physics, transport |

pub mod alloc;
pub mod client;
pub mod clock;
pub mod config;
pub mod engine_bridge;
pub mod entity;
pub mod input;
pub mod interest;
pub mod interp;
pub mod server;
pub mod sim;
pub mod snapshot;
pub mod state;
pub mod tick;
pub mod wire;
pub mod world;

pub use alloc::{BlockAllocator, BlockHandle};
pub use client::ClientSimulation;
pub use clock::{DriftController, RttEstimator, TickClock};
pub use config::ReplicaConfig;
pub use entity::{
    ConnectionId, Entity, EntityRef, ExternalHandle, NetworkScript, PrefabDef, PrefabId,
    PrefabRegistry, ScriptCtx, SimCommand,
};
pub use input::{InputId, InputPool, SimulationInput};
pub use interest::{CellCoord, ConnectionInterest, InterestGrid};
pub use interp::{BlendView, RemoteInterpolation};
pub use server::ServerSimulation;
pub use sim::SimulationCore;
pub use snapshot::{EntityMeta, Snapshot};
pub use state::{ChangeNotice, ChangeSource, StateSlot};
pub use tick::Tick;
pub use wire::{BandwidthStats, FragmentBuffer, InputPacket, PacketMode, SnapshotPayload};
pub use world::WorldState;

/// ALICE-Replica version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type for ALICE-Replica operations
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Error types for ALICE-Replica
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    /// The preallocated snapshot arena cannot hold another block; the
    /// configuration undersized `max_entities` or `state_words`.
    #[error("snapshot pool exhausted allocating {words} words")]
    PoolExhausted { words: u32 },
    /// A datagram failed to parse and was dropped.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    /// Every metadata slot is occupied.
    #[error("entity capacity exhausted ({0} slots)")]
    EntityCapacity(usize),
    /// Packet or operation addressed a connection that was never added.
    #[error("unknown connection {0:?}")]
    UnknownConnection(ConnectionId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_bridge::null::{NullPhysics, QueueTransport};
    use crate::engine_bridge::TransformSource;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Moves +1.0 on word 0 for every tick whose input carries block 1.
    struct Mover;
    impl NetworkScript for Mover {
        fn on_fixed_update(&mut self, ctx: &mut ScriptCtx) {
            if ctx.input.is_some_and(|i| i.block(1).is_some()) {
                let x = ctx.read_f32(0);
                ctx.write_f32(0, x + 1.0);
            }
        }
    }

    struct Positions {
        map: RefCell<HashMap<EntityRef, [f32; 3]>>,
    }

    impl Positions {
        fn new() -> Self {
            Self {
                map: RefCell::new(HashMap::new()),
            }
        }
        fn set(&self, entity: EntityRef, pos: [f32; 3]) {
            self.map.borrow_mut().insert(entity, pos);
        }
    }

    impl TransformSource for Positions {
        fn position(&self, entity: EntityRef) -> Option<[f32; 3]> {
            self.map.borrow().get(&entity).copied()
        }
    }

    fn config() -> ReplicaConfig {
        let _ = env_logger::builder().is_test(true).try_init();
        ReplicaConfig {
            max_entities: 16,
            state_words: 4,
            history_depth: 16,
            max_predicted_ticks: 8,
            ..ReplicaConfig::default()
        }
    }

    fn deliver_to_client(transport: &mut QueueTransport, client: &mut ClientSimulation) {
        for (_, datagram) in transport.sent.drain(..) {
            client.receive_datagram(&datagram).unwrap();
        }
    }

    fn deliver_to_server(transport: &mut QueueTransport, server: &mut ServerSimulation) {
        for (to, datagram) in transport.sent.drain(..) {
            server.receive_input_packet(to, &datagram).unwrap();
        }
    }

    /// Full loopback: client predicts two ticks ahead, inputs drive the
    /// authoritative entity, reconciliation keeps both sides identical.
    #[test]
    fn test_loopback_prediction_converges() {
        let cfg = config();
        let positions = Positions::new();

        let mut server = ServerSimulation::new(cfg.clone());
        server.register_prefab(PrefabDef::new(PrefabId(1), 4, || vec![Box::new(Mover)]));
        server.add_connection(ConnectionId(0));
        let meta_id = server.spawn_for(ConnectionId(0), PrefabId(1)).unwrap();

        let mut client = ClientSimulation::new(cfg, ConnectionId(0));
        client.register_prefab(PrefabDef::new(PrefabId(1), 4, || vec![Box::new(Mover)]));

        let mut s2c = QueueTransport::default();
        let mut c2s = QueueTransport::default();

        // bootstrap: the first snapshot spawns the client's copy
        server.step(Tick(1), &positions, &mut NullPhysics, &mut s2c);
        positions.set(server.core.entity(meta_id).unwrap().entity_ref, [0.0; 3]);
        deliver_to_client(&mut s2c, &mut client);
        assert_eq!(client.authoritative_tick(), Tick(1));

        // steady state: client predicts t+2 while the server runs t
        let mut inputs_sent = 0;
        for t in 2..=12 {
            client.queue_local_input(1, &[1]);
            client.predict_tick(Tick(t + 2), &mut c2s);
            inputs_sent += 1;
            deliver_to_server(&mut c2s, &mut server);
            server.step(Tick(t), &positions, &mut NullPhysics, &mut s2c);
            deliver_to_client(&mut s2c, &mut client);
        }

        // every input the server consumed moved the entity by one
        let server_x = state::word_to_f32(server.core.world.current.read_word(meta_id, 0));
        assert!(server_x > 0.0);

        // drain: a few input-less rounds let authority catch up
        for t in 13..=18 {
            client.predict_tick(Tick(t + 2), &mut c2s);
            deliver_to_server(&mut c2s, &mut server);
            server.step(Tick(t), &positions, &mut NullPhysics, &mut s2c);
            deliver_to_client(&mut s2c, &mut client);
        }

        let server_x = state::word_to_f32(server.core.world.current.read_word(meta_id, 0));
        let client_x = state::word_to_f32(client.core.world.current.read_word(meta_id, 0));
        assert!(
            (server_x - client_x).abs() < 1e-6,
            "client {client_x} diverged from server {server_x}"
        );
        assert!((server_x - inputs_sent as f32).abs() < 1e-6);
    }

    /// An entity outside the interest radius is never encoded; when it
    /// crosses the radius it arrives once, in full.
    #[test]
    fn test_aoi_entity_enters_view_in_full() {
        let cfg = config();
        let positions = Positions::new();

        let mut server = ServerSimulation::new(cfg.clone());
        server.register_prefab(PrefabDef::new(PrefabId(1), 4, || vec![Box::new(Mover)]));
        server.add_connection(ConnectionId(0));
        let player = server.spawn_for(ConnectionId(0), PrefabId(1)).unwrap();
        let far = server.spawn(PrefabId(1)).unwrap();

        let mut client = ClientSimulation::new(cfg.clone(), ConnectionId(0));
        client.register_prefab(PrefabDef::new(PrefabId(1), 4, || vec![Box::new(Mover)]));

        let mut s2c = QueueTransport::default();
        let mut c2s = QueueTransport::default();

        server.step(Tick(1), &positions, &mut NullPhysics, &mut s2c);
        let player_ref = server.core.entity(player).unwrap().entity_ref;
        let far_ref = server.core.entity(far).unwrap().entity_ref;
        positions.set(player_ref, [0.0; 3]);
        // 3-cell radius at 16 units/cell: 1000 is far outside
        positions.set(far_ref, [1000.0, 0.0, 0.0]);
        deliver_to_client(&mut s2c, &mut client);

        for t in 2..=6 {
            client.predict_tick(Tick(t + 2), &mut c2s);
            deliver_to_server(&mut c2s, &mut server);
            server.step(Tick(t), &positions, &mut NullPhysics, &mut s2c);
            deliver_to_client(&mut s2c, &mut client);
        }
        // five ticks out of range: the far entity never reached the client
        assert!(client.core.entity(far).is_none());

        // teleport into range; the next snapshot announces it in full
        positions.set(far_ref, [1.0, 0.0, 0.0]);
        client.predict_tick(Tick(9), &mut c2s);
        deliver_to_server(&mut c2s, &mut server);
        server.step(Tick(7), &positions, &mut NullPhysics, &mut s2c);
        deliver_to_client(&mut s2c, &mut client);

        assert!(client.core.entity(far).is_some());
        assert_eq!(
            client.core.entity(far).unwrap().entity_ref,
            far_ref
        );
    }

    /// Destroy on the server propagates to the client exactly once.
    #[test]
    fn test_loopback_destroy_propagates() {
        let cfg = config();
        let positions = Positions::new();

        let mut server = ServerSimulation::new(cfg.clone());
        server.register_prefab(PrefabDef::new(PrefabId(1), 4, || vec![Box::new(Mover)]));
        server.add_connection(ConnectionId(0));
        let player = server.spawn_for(ConnectionId(0), PrefabId(1)).unwrap();
        let other = server.spawn(PrefabId(1)).unwrap();

        let mut client = ClientSimulation::new(cfg, ConnectionId(0));
        client.register_prefab(PrefabDef::new(PrefabId(1), 4, || vec![Box::new(Mover)]));

        let mut s2c = QueueTransport::default();
        let mut c2s = QueueTransport::default();

        server.step(Tick(1), &positions, &mut NullPhysics, &mut s2c);
        positions.set(server.core.entity(player).unwrap().entity_ref, [0.0; 3]);
        let other_ref = server.core.entity(other).unwrap().entity_ref;
        positions.set(other_ref, [1.0, 0.0, 0.0]);
        deliver_to_client(&mut s2c, &mut client);
        client.predict_tick(Tick(4), &mut c2s);
        deliver_to_server(&mut c2s, &mut server);
        server.step(Tick(2), &positions, &mut NullPhysics, &mut s2c);
        deliver_to_client(&mut s2c, &mut client);
        assert!(client.core.entity(other).is_some());

        server.destroy(other_ref);
        client.predict_tick(Tick(5), &mut c2s);
        deliver_to_server(&mut c2s, &mut server);
        server.step(Tick(3), &positions, &mut NullPhysics, &mut s2c);
        deliver_to_client(&mut s2c, &mut client);

        assert!(client.core.entity(other).is_none());
        assert!(server.core.entity(other).is_none());
    }

    /// A destroy whose carrying datagram is lost still reaches the
    /// client: the removal record rides the multi-tick catch-up packet.
    #[test]
    fn test_destroy_survives_lost_datagram() {
        let cfg = config();
        let positions = Positions::new();

        let mut server = ServerSimulation::new(cfg.clone());
        server.register_prefab(PrefabDef::new(PrefabId(1), 4, || vec![Box::new(Mover)]));
        server.add_connection(ConnectionId(0));
        let player = server.spawn_for(ConnectionId(0), PrefabId(1)).unwrap();
        let other = server.spawn(PrefabId(1)).unwrap();

        let mut client = ClientSimulation::new(cfg, ConnectionId(0));
        client.register_prefab(PrefabDef::new(PrefabId(1), 4, || vec![Box::new(Mover)]));

        let mut s2c = QueueTransport::default();
        let mut c2s = QueueTransport::default();

        server.step(Tick(1), &positions, &mut NullPhysics, &mut s2c);
        positions.set(server.core.entity(player).unwrap().entity_ref, [0.0; 3]);
        let other_ref = server.core.entity(other).unwrap().entity_ref;
        positions.set(other_ref, [1.0, 0.0, 0.0]);
        deliver_to_client(&mut s2c, &mut client);

        client.predict_tick(Tick(4), &mut c2s);
        deliver_to_server(&mut c2s, &mut server);
        server.step(Tick(2), &positions, &mut NullPhysics, &mut s2c);
        deliver_to_client(&mut s2c, &mut client);
        assert!(client.core.entity(other).is_some());
        assert_eq!(client.authoritative_tick(), Tick(2));

        // the tick that replicates the destroy never arrives
        server.destroy(other_ref);
        client.predict_tick(Tick(5), &mut c2s);
        deliver_to_server(&mut c2s, &mut server);
        server.step(Tick(3), &positions, &mut NullPhysics, &mut s2c);
        s2c.sent.clear();

        // the next tick's catch-up packet carries the removal again
        client.predict_tick(Tick(6), &mut c2s);
        deliver_to_server(&mut c2s, &mut server);
        server.step(Tick(4), &positions, &mut NullPhysics, &mut s2c);
        deliver_to_client(&mut s2c, &mut client);

        assert_eq!(client.authoritative_tick(), Tick(4));
        assert!(client.core.entity(other).is_none());
    }

    /// Dropped snapshots are healed by the multi-tick encoder: every
    /// word changed inside the gap rides the catch-up packet, and both
    /// sides agree afterwards.
    #[test]
    fn test_multi_tick_catchup_restores_agreement() {
        let cfg = config();
        let positions = Positions::new();

        let mut server = ServerSimulation::new(cfg.clone());
        server.register_prefab(PrefabDef::new(PrefabId(1), 4, || vec![Box::new(Mover)]));
        server.add_connection(ConnectionId(0));
        let meta_id = server.spawn_for(ConnectionId(0), PrefabId(1)).unwrap();

        let mut client = ClientSimulation::new(cfg, ConnectionId(0));
        client.register_prefab(PrefabDef::new(PrefabId(1), 4, || vec![Box::new(Mover)]));

        let mut s2c = QueueTransport::default();
        let mut c2s = QueueTransport::default();

        server.step(Tick(1), &positions, &mut NullPhysics, &mut s2c);
        positions.set(server.core.entity(meta_id).unwrap().entity_ref, [0.0; 3]);
        deliver_to_client(&mut s2c, &mut client);

        let mut inputs_sent = 0;
        for t in 2..=10 {
            client.queue_local_input(1, &[1]);
            client.predict_tick(Tick(t + 2), &mut c2s);
            inputs_sent += 1;
            deliver_to_server(&mut c2s, &mut server);
            server.step(Tick(t), &positions, &mut NullPhysics, &mut s2c);
            if t == 3 || t == 4 {
                // lost on the wire; the client's ack stays at tick 2
                s2c.sent.clear();
            } else {
                deliver_to_client(&mut s2c, &mut client);
            }
        }
        // the first delivered packet after the gap was a catch-up, not a
        // delta against a tick the client never saw
        assert_eq!(client.authoritative_tick(), Tick(10));

        // input-less drain so the last predicted targets reach authority
        for t in 11..=16 {
            client.predict_tick(Tick(t + 2), &mut c2s);
            deliver_to_server(&mut c2s, &mut server);
            server.step(Tick(t), &positions, &mut NullPhysics, &mut s2c);
            deliver_to_client(&mut s2c, &mut client);
        }

        let server_x = state::word_to_f32(server.core.world.current.read_word(meta_id, 0));
        let client_x = state::word_to_f32(client.core.world.current.read_word(meta_id, 0));
        assert!((server_x - inputs_sent as f32).abs() < 1e-6);
        assert!(
            (server_x - client_x).abs() < 1e-6,
            "client {client_x} diverged from server {server_x} across the gap"
        );
    }
}
