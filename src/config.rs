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

//! Engine configuration
//!
//! Every capacity in the engine is fixed at construction time. The
//! allocator never grows (see `alloc`), so undersizing these knobs is a
//! fatal configuration error, not a runtime condition to recover from.

use serde::{Deserialize, Serialize};

/// Complete configuration surface for a server or client simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Fixed simulation rate in ticks per second.
    pub tick_rate: f64,
    /// How many ticks a client may run ahead of the last authoritative
    /// tick before prediction is declared lost.
    pub max_predicted_ticks: u32,
    /// Snapshot ring depth. Bounds multi-tick catch-up encoding and
    /// history lookups.
    pub history_depth: usize,
    /// Maximum live entities (size of the metadata array).
    pub max_entities: usize,
    /// Per-entity networked state capacity, in 4-byte words.
    pub state_words: u32,
    /// Edge length of one AOI cell in world units.
    pub aoi_cell_size: f32,
    /// Interest radius in cells (Chebyshev distance).
    pub aoi_interest_radius: i32,
    /// Extra cells an already-visible entity may drift before unloading.
    pub aoi_unload_hysteresis: i32,
    /// Largest datagram payload handed to the transport; larger
    /// snapshots are fragmented.
    pub max_payload_bytes: usize,
    /// Per-connection bound on queued, not-yet-simulated inputs.
    pub max_queued_inputs: usize,
    /// Distinct input block types a single `SimulationInput` may carry.
    pub input_types: usize,
    /// Remote interpolation target buffer, in ticks.
    pub remote_interp_delay: f64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60.0,
            max_predicted_ticks: 16,
            history_depth: 32,
            max_entities: 512,
            state_words: 32,
            aoi_cell_size: 16.0,
            aoi_interest_radius: 3,
            aoi_unload_hysteresis: 1,
            max_payload_bytes: 1200,
            max_queued_inputs: 8,
            input_types: 4,
            remote_interp_delay: 2.0,
        }
    }
}

impl ReplicaConfig {
    /// Seconds per tick at the nominal rate.
    #[inline]
    #[must_use]
    pub fn tick_duration(&self) -> f64 {
        1.0 / self.tick_rate
    }

    /// Word capacity one snapshot's allocator is built with.
    ///
    /// Two blocks per entity (state + dirty map of equal word count),
    /// each carrying the allocator's per-block header, plus one spare
    /// block of slack so splitting never runs the arena to exactly zero.
    #[must_use]
    pub fn allocator_words(&self) -> u32 {
        let per_block = self.state_words.max(crate::alloc::MIN_BLOCK_WORDS)
            + crate::alloc::HEADER_WORDS;
        (self.max_entities as u32 + 1) * per_block * 2
    }

    /// How many pooled inputs the client keeps: one per predicted tick,
    /// plus slack for the input being authored this frame.
    #[must_use]
    pub fn input_pool_size(&self) -> usize {
        (self.max_predicted_ticks as usize + 2) * self.input_types.max(1)
    }

    /// Upper bound on one reassembled snapshot payload: header plus, per
    /// slot, up to two metadata records and a fully spliced state run.
    /// Fragments claiming offsets past this are forged or corrupt.
    #[must_use]
    pub fn max_snapshot_bytes(&self) -> usize {
        32 + self.max_entities * (42 + 8 * self.state_words as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_self_consistent() {
        let cfg = ReplicaConfig::default();
        assert!(cfg.tick_duration() > 0.0);
        assert!(cfg.history_depth as u32 >= cfg.max_predicted_ticks);
        assert!(cfg.allocator_words() > cfg.max_entities as u32 * cfg.state_words * 2);
        assert!(cfg.input_pool_size() >= cfg.max_predicted_ticks as usize);
    }
}
