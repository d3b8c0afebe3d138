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

//! Entity state layout and dirty tracking
//!
//! Networked fields are packed in declaration order into one contiguous
//! block of 4-byte words; a parallel block of equal word count records,
//! per word, whether it changed since the last tick reset. Writes are
//! compare-on-write: an unchanged value marks nothing, a changed value
//! sets the dirty word, flags the entity, and enqueues a change notice
//! for the word's registered callback. This word-level diff feeds both
//! the replication delta and the reconciliation callback pass.

use crate::alloc::BlockHandle;
use crate::entity::EntityRef;
use std::fmt;
use std::rc::Rc;

/// Where an entity's two blocks live inside a snapshot's allocator.
///
/// Handles stay valid across snapshot deep-copies, so one slot
/// describes the entity in every snapshot of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSlot {
    pub state: BlockHandle,
    pub dirty: BlockHandle,
    pub words: u32,
}

impl StateSlot {
    pub const INVALID: Self = Self {
        state: BlockHandle::INVALID,
        dirty: BlockHandle::INVALID,
        words: 0,
    };

    #[inline(always)]
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.state.is_valid()
    }
}

impl Default for StateSlot {
    fn default() -> Self {
        Self::INVALID
    }
}

/// What caused a field transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// Written by local simulation (server tick or client prediction).
    Predicted,
    /// Overwritten by an authoritative snapshot during reconciliation;
    /// `old` is the pre-rollback predicted value.
    Authoritative,
    /// Net effect of an input replay, diffed after resimulation.
    Resimulated,
}

/// One field transition, delivered to the word's registered callback.
#[derive(Debug, Clone, Copy)]
pub struct ChangeNotice {
    pub entity: EntityRef,
    pub meta_id: u16,
    pub word: u16,
    pub old: u32,
    pub new: u32,
    pub source: ChangeSource,
}

/// Callback registered for one word offset of a prefab's state block.
#[derive(Clone)]
pub struct ChangeHook {
    /// When false, the hook is suppressed for `Resimulated` notices.
    pub invoke_during_resim: bool,
    pub func: Rc<dyn Fn(&ChangeNotice)>,
}

impl fmt::Debug for ChangeHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeHook")
            .field("invoke_during_resim", &self.invoke_during_resim)
            .finish_non_exhaustive()
    }
}

/// Per-prefab table of change hooks, keyed by word offset and shared by
/// every entity of that type.
#[derive(Debug, Default, Clone)]
pub struct CallbackTable {
    hooks: Vec<Option<ChangeHook>>,
}

impl CallbackTable {
    #[must_use]
    pub fn new(words: u32) -> Self {
        Self {
            hooks: vec![None; words as usize],
        }
    }

    /// Register a hook for one word offset.
    ///
    /// # Panics
    /// Panics when the offset is outside the prefab's state block; a
    /// mis-registered offset would otherwise corrupt callback dispatch.
    pub fn on_change(
        &mut self,
        word: u16,
        invoke_during_resim: bool,
        func: impl Fn(&ChangeNotice) + 'static,
    ) {
        let idx = word as usize;
        assert!(
            idx < self.hooks.len(),
            "hook offset {idx} beyond state block of {} words",
            self.hooks.len()
        );
        self.hooks[idx] = Some(ChangeHook {
            invoke_during_resim,
            func: Rc::new(func),
        });
    }

    #[inline]
    #[must_use]
    pub fn hook(&self, word: u16) -> Option<&ChangeHook> {
        self.hooks.get(word as usize).and_then(Option::as_ref)
    }

    /// Dispatch one notice to its hook, honoring resim suppression.
    pub fn dispatch(&self, notice: &ChangeNotice) {
        if let Some(hook) = self.hook(notice.word) {
            if notice.source == ChangeSource::Resimulated && !hook.invoke_during_resim {
                return;
            }
            (hook.func)(notice);
        }
    }
}

/// Reinterpret an f32 field as its wire word.
#[inline(always)]
#[must_use]
pub fn f32_to_word(v: f32) -> u32 {
    v.to_bits()
}

/// Reinterpret a wire word as an f32 field.
#[inline(always)]
#[must_use]
pub fn word_to_f32(w: u32) -> f32 {
    f32::from_bits(w)
}

/// Reinterpret an i32 field as its wire word.
#[inline(always)]
#[must_use]
pub fn i32_to_word(v: i32) -> u32 {
    v as u32
}

/// Reinterpret a wire word as an i32 field.
#[inline(always)]
#[must_use]
pub fn word_to_i32(w: u32) -> i32 {
    w as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_state_slot_sentinel() {
        assert!(!StateSlot::INVALID.is_valid());
        assert!(!StateSlot::default().is_valid());
    }

    #[test]
    fn test_callback_dispatch_and_suppression() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut table = CallbackTable::new(8);

        let sink = Rc::clone(&fired);
        table.on_change(2, false, move |n| sink.borrow_mut().push((n.word, n.new)));

        let notice = ChangeNotice {
            entity: EntityRef(7),
            meta_id: 0,
            word: 2,
            old: 0,
            new: 5,
            source: ChangeSource::Predicted,
        };
        table.dispatch(&notice);
        assert_eq!(fired.borrow().as_slice(), &[(2, 5)]);

        // resim notices are suppressed for hooks that opted out
        table.dispatch(&ChangeNotice {
            source: ChangeSource::Resimulated,
            ..notice
        });
        assert_eq!(fired.borrow().len(), 1);

        // authoritative notices always reach the hook
        table.dispatch(&ChangeNotice {
            source: ChangeSource::Authoritative,
            ..notice
        });
        assert_eq!(fired.borrow().len(), 2);
    }

    #[test]
    fn test_unhooked_word_is_silent() {
        let table = CallbackTable::new(4);
        table.dispatch(&ChangeNotice {
            entity: EntityRef(1),
            meta_id: 0,
            word: 3,
            old: 0,
            new: 1,
            source: ChangeSource::Predicted,
        });
    }

    #[test]
    fn test_word_reinterpret_round_trip() {
        assert_eq!(word_to_f32(f32_to_word(3.5)), 3.5);
        assert_eq!(word_to_i32(i32_to_word(-17)), -17);
    }
}
