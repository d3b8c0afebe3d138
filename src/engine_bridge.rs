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

//! Host engine bridge - every external collaborator, at its boundary
//!
//! The core owns no game objects, no transforms, no physics and no
//! sockets. Each is a trait the host passes in at construction; nothing
//! here is a process-wide singleton. All calls happen synchronously on
//! the frame thread.

use crate::entity::{EntityRef, ExternalHandle, PrefabId};
use crate::snapshot::Snapshot;

/// Spawns and despawns the host engine's renderable objects.
pub trait ObjectSpawner {
    fn spawn(&mut self, prefab: PrefabId, pos: [f32; 3], rot: [f32; 4]) -> ExternalHandle;
    fn despawn(&mut self, handle: ExternalHandle);
}

/// Read access to entity transforms, used for AOI bucketing.
pub trait TransformSource {
    /// World position of an entity, `None` if the host object is gone.
    fn position(&self, entity: EntityRef) -> Option<[f32; 3]>;
}

/// Lag-compensated hit detection provider. The core hands it the two
/// historical snapshots bracketing the shooter's view plus the blend
/// alpha; the host rewinds its colliders and casts.
pub trait PhysicsRaycaster {
    #[allow(clippy::too_many_arguments)]
    fn raycast(
        &mut self,
        from_snapshot: &Snapshot,
        to_snapshot: &Snapshot,
        alpha: f32,
        origin: [f32; 3],
        direction: [f32; 3],
        max_distance: f32,
    ) -> Option<EntityRef>;
}

/// Fixed-step physics integration hook, run once per simulation tick
/// between the script pass and `PostFixedUpdate`.
pub trait PhysicsStepper {
    fn step(&mut self, dt: f64);
}

/// Unreliable-datagram send half. Receive is push-style: the host calls
/// into the simulation with each arriving datagram.
pub trait Transport {
    fn send(&mut self, to: crate::entity::ConnectionId, payload: &[u8]);
}

/// No-op collaborators for tests and headless runs.
pub mod null {
    use super::*;
    use crate::entity::ConnectionId;

    #[derive(Debug, Default)]
    pub struct NullSpawner {
        next: u64,
    }

    impl ObjectSpawner for NullSpawner {
        fn spawn(&mut self, _prefab: PrefabId, _pos: [f32; 3], _rot: [f32; 4]) -> ExternalHandle {
            self.next += 1;
            ExternalHandle(self.next)
        }
        fn despawn(&mut self, _handle: ExternalHandle) {}
    }

    #[derive(Debug, Default)]
    pub struct NullPhysics;

    impl PhysicsStepper for NullPhysics {
        fn step(&mut self, _dt: f64) {}
    }

    /// Collects outgoing datagrams for inspection or loopback delivery.
    #[derive(Debug, Default)]
    pub struct QueueTransport {
        pub sent: Vec<(ConnectionId, Vec<u8>)>,
    }

    impl Transport for QueueTransport {
        fn send(&mut self, to: ConnectionId, payload: &[u8]) {
            self.sent.push((to, payload.to_vec()));
        }
    }
}
