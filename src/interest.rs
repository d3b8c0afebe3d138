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

//! Area-of-interest filtering
//!
//! Entities are bucketed into fixed-size 3D cells once per tick; a
//! connection sees an entity when its cell lies within the interest
//! radius (Chebyshev distance) of the connection's focus cell. Already
//! visible entities get an extra unload-hysteresis ring before they
//! drop out, so boundary jitter never flickers visibility. An
//! always-synced override set bypasses the radius test entirely.

use crate::config::ReplicaConfig;
use crate::entity::{ConnectionId, EntityRef, PrefabId};
use crate::tick::Tick;
use std::collections::HashSet;

/// Integer 3D cell coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellCoord {
    /// Chebyshev (chessboard) distance: the radius metric for cubic
    /// interest regions.
    #[inline]
    #[must_use]
    pub fn chebyshev(self, other: Self) -> i32 {
        (self.x - other.x)
            .abs()
            .max((self.y - other.y).abs())
            .max((self.z - other.z).abs())
    }
}

/// Bucket a world position into its cell.
#[inline]
#[must_use]
pub fn cell_of(pos: [f32; 3], cell_size: f32) -> CellCoord {
    CellCoord {
        x: (pos[0] / cell_size).floor() as i32,
        y: (pos[1] / cell_size).floor() as i32,
        z: (pos[2] / cell_size).floor() as i32,
    }
}

/// Per-tick cell assignment for every live meta slot.
#[derive(Debug)]
pub struct InterestGrid {
    cell_size: f32,
    cells: Vec<Option<CellCoord>>,
}

impl InterestGrid {
    #[must_use]
    pub fn new(cfg: &ReplicaConfig) -> Self {
        Self {
            cell_size: cfg.aoi_cell_size,
            cells: vec![None; cfg.max_entities],
        }
    }

    /// Rebuild from this tick's positions. Entities without a position
    /// (no host object yet) fall out of every interest region but stay
    /// reachable through always-synced sets.
    pub fn rebuild(&mut self, positions: impl Iterator<Item = (u16, Option<[f32; 3]>)>) {
        self.cells.fill(None);
        for (meta_id, pos) in positions {
            self.cells[meta_id as usize] = pos.map(|p| cell_of(p, self.cell_size));
        }
    }

    #[inline]
    #[must_use]
    pub fn cell(&self, meta_id: u16) -> Option<CellCoord> {
        self.cells[meta_id as usize]
    }

    #[inline]
    #[must_use]
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }
}

/// A destroy this peer saw happen but may not have received: the
/// datagram carrying the removal is unacknowledged, so the record rides
/// in every subsequent packet until the peer acks past `destroyed_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRemoval {
    pub meta_id: u16,
    pub entity_ref: EntityRef,
    pub prefab: PrefabId,
    pub input_source: ConnectionId,
    pub destroyed_at: Tick,
}

/// One connection's view of the world, recomputed every tick.
#[derive(Debug)]
pub struct ConnectionInterest {
    interest_radius: i32,
    unload_radius: i32,
    visible: HashSet<u16>,
    always_synced: HashSet<u16>,
    /// Explicit focus position override; otherwise the owned entity's
    /// cell is the focus.
    pub focus_override: Option<[f32; 3]>,
    entered: Vec<u16>,
    left: Vec<u16>,
    pending_removals: Vec<PendingRemoval>,
}

impl ConnectionInterest {
    #[must_use]
    pub fn new(cfg: &ReplicaConfig) -> Self {
        Self {
            interest_radius: cfg.aoi_interest_radius,
            unload_radius: cfg.aoi_interest_radius + cfg.aoi_unload_hysteresis,
            visible: HashSet::new(),
            always_synced: HashSet::new(),
            focus_override: None,
            entered: Vec::new(),
            left: Vec::new(),
            pending_removals: Vec::new(),
        }
    }

    /// Pin an entity into this connection's view regardless of range.
    pub fn always_sync(&mut self, meta_id: u16) {
        self.always_synced.insert(meta_id);
    }

    pub fn remove_always_sync(&mut self, meta_id: u16) {
        self.always_synced.remove(&meta_id);
    }

    /// Recompute visibility against this tick's grid.
    ///
    /// `focus` is the connection's own cell; `None` (no owned entity,
    /// no override) collapses the view to the always-synced set.
    /// Afterwards `entered()` lists entities to send in full and
    /// `left()` entities owed one removal-eligible record.
    pub fn update(&mut self, grid: &InterestGrid, focus: Option<CellCoord>, live: &[u16]) {
        self.entered.clear();
        self.left.clear();

        let mut next: HashSet<u16> = HashSet::with_capacity(self.visible.len());
        for &meta_id in live {
            let keep = if self.always_synced.contains(&meta_id) {
                true
            } else if let (Some(f), Some(c)) = (focus, grid.cell(meta_id)) {
                let d = f.chebyshev(c);
                if self.visible.contains(&meta_id) {
                    d <= self.unload_radius
                } else {
                    d <= self.interest_radius
                }
            } else {
                false
            };
            if keep {
                next.insert(meta_id);
                if !self.visible.contains(&meta_id) {
                    self.entered.push(meta_id);
                }
            }
        }
        for &meta_id in &self.visible {
            if !next.contains(&meta_id) {
                self.left.push(meta_id);
            }
        }
        self.visible = next;
        self.entered.sort_unstable();
        self.left.sort_unstable();
    }

    /// Forget everything; every visible entity re-enters on the next
    /// update. Used after catastrophic loss forces a full resend; a full
    /// packet conveys removals by omission, so none stay pending.
    pub fn reset_baseline(&mut self) {
        self.visible.clear();
        self.entered.clear();
        self.left.clear();
        self.pending_removals.clear();
    }

    /// Drop a destroyed entity from the view. The destroy record went
    /// out in the tick that removed it; if this peer was watching, the
    /// record stays pending until the peer acks past that tick, so a
    /// lost datagram cannot leave a ghost on the peer.
    pub fn forget(&mut self, removal: PendingRemoval) {
        self.always_synced.remove(&removal.meta_id);
        if self.visible.remove(&removal.meta_id) {
            self.pending_removals.push(removal);
        }
    }

    /// Retire pending removals the peer has confirmed receiving.
    pub fn prune_removals(&mut self, acked: Tick) {
        self.pending_removals.retain(|r| r.destroyed_at > acked);
    }

    /// Removal records still owed to this peer.
    #[must_use]
    pub fn pending_removals(&self) -> &[PendingRemoval] {
        &self.pending_removals
    }

    #[inline]
    #[must_use]
    pub fn is_visible(&self, meta_id: u16) -> bool {
        self.visible.contains(&meta_id)
    }

    #[must_use]
    pub fn entered(&self) -> &[u16] {
        &self.entered
    }

    #[must_use]
    pub fn left(&self) -> &[u16] {
        &self.left
    }

    pub fn visible(&self) -> impl Iterator<Item = u16> + '_ {
        self.visible.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ReplicaConfig {
        ReplicaConfig {
            max_entities: 8,
            aoi_cell_size: 10.0,
            aoi_interest_radius: 2,
            aoi_unload_hysteresis: 1,
            ..ReplicaConfig::default()
        }
    }

    fn grid_with(positions: &[(u16, [f32; 3])]) -> InterestGrid {
        let mut grid = InterestGrid::new(&cfg());
        grid.rebuild(positions.iter().map(|&(id, p)| (id, Some(p))));
        grid
    }

    #[test]
    fn test_cell_bucketing() {
        assert_eq!(cell_of([0.0, 0.0, 0.0], 10.0), CellCoord { x: 0, y: 0, z: 0 });
        assert_eq!(cell_of([-0.1, 15.0, 29.9], 10.0), CellCoord { x: -1, y: 1, z: 2 });
        let a = CellCoord { x: 0, y: 0, z: 0 };
        let b = CellCoord { x: 3, y: -1, z: 2 };
        assert_eq!(a.chebyshev(b), 3);
    }

    #[test]
    fn test_enter_exactly_once_on_transition() {
        let mut interest = ConnectionInterest::new(&cfg());
        let focus = Some(CellCoord { x: 0, y: 0, z: 0 });

        // entity 1 out of range (cell x=5, distance 5 > radius 2)
        let grid = grid_with(&[(1, [50.0, 0.0, 0.0])]);
        interest.update(&grid, focus, &[1]);
        assert!(interest.entered().is_empty());
        assert!(!interest.is_visible(1));

        // moves into range: enters exactly once
        let grid = grid_with(&[(1, [15.0, 0.0, 0.0])]);
        interest.update(&grid, focus, &[1]);
        assert_eq!(interest.entered(), &[1]);
        assert!(interest.is_visible(1));

        // stays in range: no second enter
        interest.update(&grid, focus, &[1]);
        assert!(interest.entered().is_empty());
    }

    #[test]
    fn test_unload_hysteresis_band() {
        let mut interest = ConnectionInterest::new(&cfg());
        let focus = Some(CellCoord { x: 0, y: 0, z: 0 });

        let grid = grid_with(&[(1, [15.0, 0.0, 0.0])]); // cell 1, inside
        interest.update(&grid, focus, &[1]);
        assert!(interest.is_visible(1));

        // drifts to cell 3: beyond interest (2) but inside unload (3)
        let grid = grid_with(&[(1, [35.0, 0.0, 0.0])]);
        interest.update(&grid, focus, &[1]);
        assert!(interest.is_visible(1));
        assert!(interest.left().is_empty());

        // cell 4: beyond unload, leaves exactly once
        let grid = grid_with(&[(1, [45.0, 0.0, 0.0])]);
        interest.update(&grid, focus, &[1]);
        assert_eq!(interest.left(), &[1]);
        assert!(!interest.is_visible(1));
        interest.update(&grid, focus, &[1]);
        assert!(interest.left().is_empty());

        // a fresh entity at cell 3 does NOT enter: hysteresis only
        // protects what is already visible
        let grid = grid_with(&[(2, [35.0, 0.0, 0.0])]);
        interest.update(&grid, focus, &[2]);
        assert!(!interest.is_visible(2));
    }

    #[test]
    fn test_always_synced_ignores_range() {
        let mut interest = ConnectionInterest::new(&cfg());
        interest.always_sync(3);
        let grid = grid_with(&[(3, [500.0, 0.0, 0.0])]);
        interest.update(&grid, None, &[3]);
        assert!(interest.is_visible(3));
        assert_eq!(interest.entered(), &[3]);
    }

    #[test]
    fn test_forget_keeps_removal_pending_until_acked() {
        let mut interest = ConnectionInterest::new(&cfg());
        let focus = Some(CellCoord { x: 0, y: 0, z: 0 });
        let grid = grid_with(&[(1, [5.0, 0.0, 0.0])]);
        interest.update(&grid, focus, &[1]);
        assert!(interest.is_visible(1));

        let removal = PendingRemoval {
            meta_id: 1,
            entity_ref: EntityRef(7),
            prefab: PrefabId(1),
            input_source: ConnectionId::NONE,
            destroyed_at: Tick(4),
        };
        interest.forget(removal);
        assert!(!interest.is_visible(1));
        assert_eq!(interest.pending_removals(), &[removal]);

        // an ack of an earlier tick keeps the record owed
        interest.prune_removals(Tick(3));
        assert_eq!(interest.pending_removals().len(), 1);
        interest.prune_removals(Tick(4));
        assert!(interest.pending_removals().is_empty());

        // a peer that never saw the entity is owed nothing
        interest.forget(removal);
        assert!(interest.pending_removals().is_empty());
    }

    #[test]
    fn test_reset_baseline_reenters_everything() {
        let mut interest = ConnectionInterest::new(&cfg());
        let focus = Some(CellCoord { x: 0, y: 0, z: 0 });
        let grid = grid_with(&[(1, [5.0, 0.0, 0.0])]);
        interest.update(&grid, focus, &[1]);
        assert_eq!(interest.entered(), &[1]);

        interest.reset_baseline();
        interest.update(&grid, focus, &[1]);
        assert_eq!(interest.entered(), &[1]);
    }
}
