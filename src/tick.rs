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

//! Tick counter - the unit of simulation time
//!
//! Every temporal decision in the engine (history lookup, input ordering,
//! packet acceptance, rollback depth) is tick arithmetic on this type.
//! `-1` is the shared "invalid" sentinel, mirrored on the wire.

use bitcode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Signed tick counter. `Tick::INVALID` (-1) marks "no tick".
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
pub struct Tick(pub i32);

impl Tick {
    pub const INVALID: Self = Self(-1);
    pub const ZERO: Self = Self(0);

    #[inline(always)]
    #[must_use]
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    #[inline(always)]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Ring slot for this tick given a history depth.
    ///
    /// # Panics
    /// Panics on an invalid tick; callers must never index history with
    /// the sentinel.
    #[inline(always)]
    #[must_use]
    pub fn ring_slot(self, depth: usize) -> usize {
        assert!(self.is_valid(), "ring_slot on invalid tick");
        self.0 as usize % depth
    }

    /// Distance from `other` to `self` in ticks (may be negative).
    #[inline(always)]
    #[must_use]
    pub const fn since(self, other: Self) -> i32 {
        self.0 - other.0
    }

    #[inline(always)]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[inline(always)]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0 - 1)
    }
}

impl Default for Tick {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "T{}", self.0)
        } else {
            write!(f, "T?")
        }
    }
}

impl Add<i32> for Tick {
    type Output = Tick;
    #[inline(always)]
    fn add(self, rhs: i32) -> Tick {
        Tick(self.0 + rhs)
    }
}

impl AddAssign<i32> for Tick {
    #[inline(always)]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl Sub<i32> for Tick {
    type Output = Tick;
    #[inline(always)]
    fn sub(self, rhs: i32) -> Tick {
        Tick(self.0 - rhs)
    }
}

impl SubAssign<i32> for Tick {
    #[inline(always)]
    fn sub_assign(&mut self, rhs: i32) {
        self.0 -= rhs;
    }
}

impl Sub<Tick> for Tick {
    type Output = i32;
    #[inline(always)]
    fn sub(self, rhs: Tick) -> i32 {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_sentinel() {
        assert!(!Tick::INVALID.is_valid());
        assert!(Tick::ZERO.is_valid());
        assert_eq!(Tick::default(), Tick::INVALID);
    }

    #[test]
    fn test_tick_arithmetic() {
        let t = Tick(10);
        assert_eq!(t + 5, Tick(15));
        assert_eq!(t - 3, Tick(7));
        assert_eq!(Tick(15) - Tick(10), 5);
        assert_eq!(t.next(), Tick(11));
        assert_eq!(t.since(Tick(4)), 6);
        assert!(Tick(3) < Tick(4));
    }

    #[test]
    fn test_ring_slot_wraps() {
        assert_eq!(Tick(0).ring_slot(32), 0);
        assert_eq!(Tick(33).ring_slot(32), 1);
        assert_eq!(Tick(95).ring_slot(32), 31);
    }

    #[test]
    #[should_panic(expected = "invalid tick")]
    fn test_ring_slot_rejects_sentinel() {
        let _ = Tick::INVALID.ring_slot(32);
    }
}
