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

//! Render-time interpolation
//!
//! Locally predicted entities blend between the previous and current
//! tick with the clock's alpha. Remotely owned entities instead play
//! back a delayed timeline over the snapshot ring at an adjustable
//! rate, so late packets stretch time rather than pop; playback clamps
//! at the newest received tick and never extrapolates.

use crate::config::ReplicaConfig;
use crate::snapshot::Snapshot;
use crate::state::word_to_f32;
use crate::tick::Tick;
use crate::world::WorldState;

// ============================================================================
// Blend view
// ============================================================================

/// Read-only lerp over two snapshots of the same world.
#[derive(Clone, Copy)]
pub struct BlendView<'a> {
    pub from: &'a Snapshot,
    pub to: &'a Snapshot,
    pub alpha: f32,
}

impl<'a> BlendView<'a> {
    #[must_use]
    pub fn new(from: &'a Snapshot, to: &'a Snapshot, alpha: f32) -> Self {
        Self {
            from,
            to,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    /// Blend between the start and end of the current tick.
    ///
    /// The ring slot stamped with the current tick holds the state
    /// before this tick's simulation ran. Falls back to a degenerate
    /// (current, current) view before any history exists.
    #[must_use]
    pub fn local(world: &'a WorldState, alpha: f32) -> Self {
        let prev = world
            .history(world.current.tick)
            .unwrap_or(&world.current);
        Self::new(prev, &world.current, alpha)
    }

    /// Latest exact value, no blending.
    #[must_use]
    pub fn read_word(&self, meta_id: u16, word: u16) -> u32 {
        self.to.read_word(meta_id, word)
    }

    /// Linear blend of a float word. Entities absent from the older
    /// snapshot render at their newest value.
    #[must_use]
    pub fn read_f32(&self, meta_id: u16, word: u16) -> f32 {
        let b = word_to_f32(self.to.read_word(meta_id, word));
        if !self.from.slot(meta_id).is_valid() || !self.from.meta(meta_id).is_valid() {
            return b;
        }
        let a = word_to_f32(self.from.read_word(meta_id, word));
        a + (b - a) * self.alpha
    }

    #[must_use]
    pub fn read_f32_vec3(&self, meta_id: u16, base_word: u16) -> [f32; 3] {
        [
            self.read_f32(meta_id, base_word),
            self.read_f32(meta_id, base_word + 1),
            self.read_f32(meta_id, base_word + 2),
        ]
    }
}

// ============================================================================
// Remote playback
// ============================================================================

/// Playback rate bounds; outside the band time stretches, it never runs
/// backwards or skips.
const MIN_PLAYBACK_RATE: f64 = 0.5;
const MAX_PLAYBACK_RATE: f64 = 1.5;

/// Delayed playback cursor over the authoritative snapshot ring.
#[derive(Debug, Clone)]
pub struct RemoteInterpolation {
    tick_duration: f64,
    /// Target distance, in ticks, behind the newest received snapshot.
    target_delay: f64,
    /// Fractional playback position on the remote timeline.
    cursor: f64,
    newest: Tick,
    playback_rate: f64,
}

impl RemoteInterpolation {
    #[must_use]
    pub fn new(config: &ReplicaConfig) -> Self {
        Self {
            tick_duration: config.tick_duration(),
            target_delay: config.remote_interp_delay,
            cursor: f64::from(Tick::INVALID.0),
            newest: Tick::INVALID,
            playback_rate: 1.0,
        }
    }

    /// Note a newly applied authoritative tick.
    pub fn observe(&mut self, authoritative: Tick) {
        if authoritative <= self.newest {
            return;
        }
        self.newest = authoritative;
        if self.cursor < 0.0 {
            self.cursor = f64::from(authoritative.0) - self.target_delay;
        }
    }

    /// Advance playback by wall time, stretching or compressing the
    /// rate toward the target delay.
    pub fn advance(&mut self, delta_seconds: f64) {
        if !self.newest.is_valid() {
            return;
        }
        let delay = f64::from(self.newest.0) - self.cursor;
        let error = delay - self.target_delay;
        // half a tick of error swings the rate by 25%
        self.playback_rate =
            (1.0 + error * 0.5).clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE);
        self.cursor += delta_seconds / self.tick_duration * self.playback_rate;
        // clamp, never extrapolate past what arrived
        let newest = f64::from(self.newest.0);
        if self.cursor > newest {
            self.cursor = newest;
        }
    }

    #[must_use]
    pub fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    /// Current playback position as `(from_tick, alpha)`; the blend
    /// target is `from_tick + 1`.
    #[must_use]
    pub fn position(&self) -> Option<(Tick, f32)> {
        if self.cursor < 0.0 {
            return None;
        }
        let from = self.cursor.floor();
        Some((Tick(from as i32), (self.cursor - from) as f32))
    }

    /// Resolve the playback position against the ring. Returns `None`
    /// until playback starts or when the ring no longer holds the
    /// bracketing snapshots.
    #[must_use]
    pub fn sample<'a>(&self, world: &'a WorldState) -> Option<BlendView<'a>> {
        let (from_tick, alpha) = self.position()?;
        // ring slot t holds state at the start of tick t; the state
        // produced by tick t is stamped t+1
        let from = world.history(from_tick.next())?;
        let to = if from_tick.next() >= self.newest {
            from
        } else {
            world.history(from_tick.next().next())?
        };
        Some(BlendView::new(from, to, alpha))
    }

    /// Drop playback state after a full resync.
    pub fn reset(&mut self) {
        self.cursor = f64::from(Tick::INVALID.0);
        self.newest = Tick::INVALID;
        self.playback_rate = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::f32_to_word;

    fn small_config() -> ReplicaConfig {
        ReplicaConfig {
            max_entities: 4,
            state_words: 4,
            history_depth: 8,
            ..ReplicaConfig::default()
        }
    }

    #[test]
    fn test_blend_view_lerps_floats() {
        let cfg = small_config();
        let mut world = WorldState::new(&cfg);
        world.current.init(Tick(0));
        let meta_id = 0u16;
        let meta = crate::snapshot::EntityMeta {
            entity_ref: crate::entity::EntityRef(1),
            ..crate::snapshot::EntityMeta::INVALID
        };
        world.current.alloc_entity(meta_id, meta, 4).unwrap();
        world.current.write_word(meta_id, 0, f32_to_word(10.0));
        world.begin_tick(Tick(1));
        world.current.write_word(meta_id, 0, f32_to_word(20.0));

        let view = BlendView::local(&world, 0.5);
        assert!((view.read_f32(meta_id, 0) - 15.0).abs() < 1e-6);
        let view = BlendView::local(&world, 0.0);
        assert!((view.read_f32(meta_id, 0) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_remote_playback_lags_and_never_extrapolates() {
        let cfg = small_config();
        let dt = cfg.tick_duration();
        let mut remote = RemoteInterpolation::new(&cfg);
        assert!(remote.position().is_none());

        remote.observe(Tick(100));
        let (from, _) = remote.position().unwrap();
        assert_eq!(from, Tick(98)); // default delay of 2 ticks

        // no new snapshots: playback must clamp at tick 100
        for _ in 0..400 {
            remote.advance(dt);
        }
        let (from, alpha) = remote.position().unwrap();
        assert_eq!(from, Tick(100));
        assert_eq!(alpha, 0.0);
    }

    #[test]
    fn test_remote_playback_rate_stretches_toward_delay() {
        let cfg = small_config();
        let dt = cfg.tick_duration();
        let mut remote = RemoteInterpolation::new(&cfg);
        remote.observe(Tick(10));
        // feed ticks faster than playback consumes: delay grows, rate rises
        for t in 11..30 {
            remote.observe(Tick(t));
        }
        remote.advance(dt);
        assert!(remote.playback_rate() > 1.0);
    }

    #[test]
    fn test_observe_ignores_stale_ticks() {
        let cfg = small_config();
        let mut remote = RemoteInterpolation::new(&cfg);
        remote.observe(Tick(50));
        remote.observe(Tick(40));
        let (from, _) = remote.position().unwrap();
        assert_eq!(from, Tick(48));
    }
}
