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

//! Fixed-tick clock
//!
//! Wall time accumulates into fixed-duration ticks; the fractional
//! remainder is the interpolation alpha for rendering between the
//! previous and current tick. The client variant additionally nudges
//! its effective tick duration by a few percent so its predicted ticks
//! stay a target lead ahead of the server, instead of snapping.

use crate::config::ReplicaConfig;
use crate::tick::Tick;

/// Never run more fixed ticks than this per advance; beyond it the
/// accumulator is dropped and the simulation jumps.
const MAX_CATCH_UP_TICKS: u32 = 8;

/// Largest per-tick rate adjustment the drift controller applies.
const MAX_DRIFT_SCALE: f64 = 0.05;

// ============================================================================
// Tick clock
// ============================================================================

/// Accumulator-driven fixed-step clock.
#[derive(Debug, Clone)]
pub struct TickClock {
    tick_duration: f64,
    accumulator: f64,
    /// Multiplier on consumed wall time; 1.0 means locked to real time.
    rate_scale: f64,
    pub tick: Tick,
}

impl TickClock {
    #[must_use]
    pub fn new(config: &ReplicaConfig) -> Self {
        Self {
            tick_duration: config.tick_duration(),
            accumulator: 0.0,
            rate_scale: 1.0,
            tick: Tick::ZERO,
        }
    }

    /// Feed elapsed wall seconds; returns how many fixed ticks to run.
    ///
    /// `tick` has already advanced by the returned count when this
    /// returns, so callers simulate up to and including `self.tick`.
    pub fn advance(&mut self, delta_seconds: f64) -> u32 {
        self.accumulator += delta_seconds * self.rate_scale;
        let mut steps = 0u32;
        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            steps += 1;
            if steps == MAX_CATCH_UP_TICKS {
                // stalled frame: drop the remainder rather than spiral
                log::warn!(
                    "tick clock dropping {:.3}s after {MAX_CATCH_UP_TICKS} catch-up ticks",
                    self.accumulator
                );
                self.accumulator = 0.0;
                break;
            }
        }
        self.tick = self.tick + steps as i32;
        steps
    }

    /// Fraction of the current tick already elapsed, for rendering.
    #[inline]
    #[must_use]
    pub fn alpha(&self) -> f32 {
        (self.accumulator / self.tick_duration).clamp(0.0, 1.0) as f32
    }

    /// Scale the clock rate; `scale` is clamped to ±5%.
    pub fn set_rate_scale(&mut self, scale: f64) {
        self.rate_scale = scale.clamp(1.0 - MAX_DRIFT_SCALE, 1.0 + MAX_DRIFT_SCALE);
    }

    #[must_use]
    pub fn rate_scale(&self) -> f64 {
        self.rate_scale
    }

    /// Hard-set the tick after a join or a desync recovery.
    pub fn snap_to(&mut self, tick: Tick) {
        self.tick = tick;
        self.accumulator = 0.0;
        self.rate_scale = 1.0;
    }
}

// ============================================================================
// Drift controller
// ============================================================================

/// Steers the client clock so its target tick leads the newest
/// authoritative tick by the prediction margin the network requires:
/// half the round trip plus jitter headroom, in ticks, plus one.
#[derive(Debug, Clone)]
pub struct DriftController {
    tick_duration: f64,
    max_predicted_ticks: u32,
    rtt: RttEstimator,
}

impl DriftController {
    #[must_use]
    pub fn new(config: &ReplicaConfig) -> Self {
        Self {
            tick_duration: config.tick_duration(),
            max_predicted_ticks: config.max_predicted_ticks,
            rtt: RttEstimator::new(),
        }
    }

    pub fn observe_rtt(&mut self, rtt_seconds: f64) {
        self.rtt.observe(rtt_seconds);
    }

    #[must_use]
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Ticks the client should run ahead of the newest authoritative
    /// tick it has seen.
    #[must_use]
    pub fn target_lead(&self) -> i32 {
        let seconds = self.rtt.smoothed() / 2.0 + 2.0 * self.rtt.jitter();
        let lead = (seconds / self.tick_duration).ceil() as i32 + 1;
        lead.clamp(1, self.max_predicted_ticks as i32)
    }

    /// Update `clock.rate_scale` from the current lead over the server.
    ///
    /// Proportional control: one tick of lead error maps to a 1% rate
    /// change, saturating at the clock's ±5% bound.
    pub fn steer(&self, clock: &mut TickClock, newest_authoritative: Tick) {
        if !newest_authoritative.is_valid() {
            return;
        }
        let lead = clock.tick - newest_authoritative;
        let error = self.target_lead() - lead;
        clock.set_rate_scale(1.0 + f64::from(error) * 0.01);
    }
}

// ============================================================================
// RTT estimator
// ============================================================================

/// Exponentially-smoothed round trip and jitter, TCP-style.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed: f64,
    jitter: f64,
    seeded: bool,
}

impl RttEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            smoothed: 0.0,
            jitter: 0.0,
            seeded: false,
        }
    }

    pub fn observe(&mut self, rtt: f64) {
        if rtt < 0.0 {
            return;
        }
        if !self.seeded {
            self.smoothed = rtt;
            self.jitter = rtt / 2.0;
            self.seeded = true;
            return;
        }
        let deviation = (rtt - self.smoothed).abs();
        self.jitter += (deviation - self.jitter) / 4.0;
        self.smoothed += (rtt - self.smoothed) / 8.0;
    }

    #[must_use]
    pub fn smoothed(&self) -> f64 {
        self.smoothed
    }

    #[must_use]
    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}
