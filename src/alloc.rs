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

//! Block allocator - O(1) segregated-fit pool behind every snapshot
//!
//! TLSF-style two-level free lists over a fixed arena of 4-byte words:
//! a first-level log2 bucket and a second-level linear subdivision make
//! locating, splitting and reinserting free blocks O(1) regardless of
//! fragment count. Every allocation is zero-filled. `free` coalesces
//! with both physical neighbors. The arena never grows: `malloc`
//! returning `None` means the configured capacity was undersized.
//!
//! All addressing is by word offset into the owned arena, never by
//! pointer, so a deep `copy_from` keeps every handle valid in the copy.
//!
//! Physical block layout (offsets in words):
//!
//! ```text
//! [h+0] payload size | FREE bit
//! [h+1] offset of physically-previous header (NIL if first)
//! [h+2] payload ...          free blocks reuse payload[0..2]
//!                            as next_free / prev_free list links
//! ```

use serde::{Deserialize, Serialize};

/// Words consumed by each block header.
pub const HEADER_WORDS: u32 = 2;

/// Smallest payload ever carved out; free-list links live in the
/// payload, so it can never drop below 2 words.
pub const MIN_BLOCK_WORDS: u32 = 4;

const NIL: u32 = u32::MAX;
const FREE_BIT: u32 = 1 << 31;
const SIZE_MASK: u32 = FREE_BIT - 1;

/// Second-level linear subdivisions per first-level bucket.
const SL_COUNT: usize = 16;
const SL_SHIFT: u32 = 4;
/// First-level buckets: sizes below `SL_COUNT` share bucket 0, above
/// that one bucket per power of two up to 2^30 words.
const FL_COUNT: usize = 28;

/// Offset of an allocation's payload inside its arena.
///
/// Only meaningful for the allocator (or an identical deep copy of it)
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHandle(pub u32);

impl BlockHandle {
    pub const INVALID: Self = Self(NIL);

    #[inline(always)]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != NIL
    }
}

/// Fixed-capacity two-level segregated-fit allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockAllocator {
    words: Vec<u32>,
    heads: Vec<u32>, // FL_COUNT * SL_COUNT list heads (header offsets)
    fl_bitmap: u32,
    sl_bitmaps: [u16; FL_COUNT],
    used_words: u32,
}

#[inline(always)]
fn msb(v: u32) -> u32 {
    31 - v.leading_zeros()
}

/// Bucket a block of `size` payload words belongs in.
#[inline]
fn mapping_insert(size: u32) -> (usize, usize) {
    if (size as usize) < SL_COUNT {
        (0, size as usize)
    } else {
        let m = msb(size);
        let fl = (m - SL_SHIFT + 1) as usize;
        let sl = ((size >> (m - SL_SHIFT)) & (SL_COUNT as u32 - 1)) as usize;
        (fl, sl)
    }
}

/// Bucket guaranteed to hold blocks of at least `size` words. Rounds the
/// request up so the first non-empty list always fits.
#[inline]
fn mapping_search(size: u32) -> (usize, usize) {
    if (size as usize) < SL_COUNT {
        (0, size as usize)
    } else {
        let rounded = size + (1 << (msb(size) - SL_SHIFT)) - 1;
        mapping_insert(rounded)
    }
}

impl BlockAllocator {
    /// Create an allocator owning `capacity` words.
    ///
    /// # Panics
    /// Panics if `capacity` cannot hold even a single minimal block.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        assert!(
            capacity >= HEADER_WORDS + MIN_BLOCK_WORDS,
            "allocator capacity {capacity} below minimum block"
        );
        let mut a = Self {
            words: vec![0; capacity as usize],
            heads: vec![NIL; FL_COUNT * SL_COUNT],
            fl_bitmap: 0,
            sl_bitmaps: [0; FL_COUNT],
            used_words: 0,
        };
        a.reset();
        a
    }

    #[inline(always)]
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.words.len() as u32
    }

    /// Payload words currently handed out (headers excluded).
    #[inline(always)]
    #[must_use]
    pub fn used_words(&self) -> u32 {
        self.used_words
    }

    // --- header helpers -------------------------------------------------

    #[inline(always)]
    fn size_of(&self, h: u32) -> u32 {
        self.words[h as usize] & SIZE_MASK
    }

    #[inline(always)]
    fn is_free(&self, h: u32) -> bool {
        self.words[h as usize] & FREE_BIT != 0
    }

    #[inline(always)]
    fn set_header(&mut self, h: u32, size: u32, free: bool) {
        debug_assert_eq!(size & FREE_BIT, 0);
        self.words[h as usize] = size | if free { FREE_BIT } else { 0 };
    }

    #[inline(always)]
    fn phys_prev(&self, h: u32) -> u32 {
        self.words[h as usize + 1]
    }

    #[inline(always)]
    fn set_phys_prev(&mut self, h: u32, prev: u32) {
        self.words[h as usize + 1] = prev;
    }

    #[inline(always)]
    fn phys_next(&self, h: u32) -> u32 {
        let n = h + HEADER_WORDS + self.size_of(h);
        if (n as usize) < self.words.len() {
            n
        } else {
            NIL
        }
    }

    // --- free list ------------------------------------------------------

    #[inline(always)]
    fn next_free(&self, h: u32) -> u32 {
        self.words[(h + HEADER_WORDS) as usize]
    }

    #[inline(always)]
    fn prev_free(&self, h: u32) -> u32 {
        self.words[(h + HEADER_WORDS + 1) as usize]
    }

    #[inline(always)]
    fn set_links(&mut self, h: u32, next: u32, prev: u32) {
        self.words[(h + HEADER_WORDS) as usize] = next;
        self.words[(h + HEADER_WORDS + 1) as usize] = prev;
    }

    fn insert_free(&mut self, h: u32) {
        let size = self.size_of(h);
        let (fl, sl) = mapping_insert(size);
        let head = self.heads[fl * SL_COUNT + sl];
        self.set_links(h, head, NIL);
        if head != NIL {
            self.words[(head + HEADER_WORDS + 1) as usize] = h;
        }
        self.heads[fl * SL_COUNT + sl] = h;
        self.fl_bitmap |= 1 << fl;
        self.sl_bitmaps[fl] |= 1 << sl;
    }

    fn remove_free(&mut self, h: u32) {
        let size = self.size_of(h);
        let (fl, sl) = mapping_insert(size);
        let next = self.next_free(h);
        let prev = self.prev_free(h);
        if prev != NIL {
            self.words[(prev + HEADER_WORDS) as usize] = next;
        } else {
            self.heads[fl * SL_COUNT + sl] = next;
        }
        if next != NIL {
            self.words[(next + HEADER_WORDS + 1) as usize] = prev;
        }
        if self.heads[fl * SL_COUNT + sl] == NIL {
            self.sl_bitmaps[fl] &= !(1 << sl);
            if self.sl_bitmaps[fl] == 0 {
                self.fl_bitmap &= !(1 << fl);
            }
        }
    }

    /// First non-empty bucket at or above `(fl, sl)`. O(1): two bitmap
    /// scans, no list walking.
    fn find_suitable(&self, fl: usize, sl: usize) -> Option<(usize, usize)> {
        let sl_map = u32::from(self.sl_bitmaps[fl]) & (!0u32 << sl);
        if sl_map != 0 {
            return Some((fl, sl_map.trailing_zeros() as usize));
        }
        let fl_map = self.fl_bitmap & (!0u32).checked_shl(fl as u32 + 1).unwrap_or(0);
        if fl_map == 0 {
            return None;
        }
        let fl2 = fl_map.trailing_zeros() as usize;
        let sl2 = u32::from(self.sl_bitmaps[fl2]).trailing_zeros() as usize;
        Some((fl2, sl2))
    }

    // --- public operations ----------------------------------------------

    /// Allocate `request` payload words, zero-filled.
    ///
    /// Returns `None` when no suitable block exists; the arena never
    /// grows, so callers treat that as a fatal configuration error.
    pub fn malloc(&mut self, request: u32) -> Option<BlockHandle> {
        let size = request.max(MIN_BLOCK_WORDS);
        let (fl, sl) = mapping_search(size);
        if fl >= FL_COUNT {
            return None;
        }
        let (fl, sl) = self.find_suitable(fl, sl)?;
        let h = self.heads[fl * SL_COUNT + sl];
        debug_assert_ne!(h, NIL);
        self.remove_free(h);

        let block_size = self.size_of(h);
        debug_assert!(block_size >= size);

        // Split when the remainder can stand alone as a block.
        if block_size >= size + HEADER_WORDS + MIN_BLOCK_WORDS {
            let rem = h + HEADER_WORDS + size;
            let rem_size = block_size - size - HEADER_WORDS;
            self.set_header(rem, rem_size, true);
            self.set_phys_prev(rem, h);
            let after = rem + HEADER_WORDS + rem_size;
            if (after as usize) < self.words.len() {
                self.set_phys_prev(after, rem);
            }
            self.insert_free(rem);
            self.set_header(h, size, false);
        } else {
            self.set_header(h, block_size, false);
        }

        let payload = h + HEADER_WORDS;
        let granted = self.size_of(h);
        self.words[payload as usize..(payload + granted) as usize].fill(0);
        self.used_words += granted;
        Some(BlockHandle(payload))
    }

    /// Release a block, coalescing with free physical neighbors.
    ///
    /// # Panics
    /// Panics on an invalid or already-freed handle; a double free is a
    /// programming error, not a recoverable condition.
    pub fn free(&mut self, handle: BlockHandle) {
        assert!(handle.is_valid(), "free of invalid handle");
        assert!(
            handle.0 >= HEADER_WORDS && (handle.0 as usize) <= self.words.len(),
            "free of out-of-range handle {}",
            handle.0
        );
        let mut h = handle.0 - HEADER_WORDS;
        assert!(!self.is_free(h), "double free at offset {h}");

        self.used_words -= self.size_of(h);
        let mut size = self.size_of(h);

        let prev = self.phys_prev(h);
        if prev != NIL && self.is_free(prev) {
            self.remove_free(prev);
            size += HEADER_WORDS + self.size_of(prev);
            h = prev;
        }
        let next = h + HEADER_WORDS + size;
        if (next as usize) < self.words.len() && self.is_free(next) {
            self.remove_free(next);
            size += HEADER_WORDS + self.size_of(next);
        }

        self.set_header(h, size, true);
        let after = h + HEADER_WORDS + size;
        if (after as usize) < self.words.len() {
            self.set_phys_prev(after, h);
        }
        self.insert_free(h);
    }

    /// Bulk O(1) release of every live allocation.
    pub fn reset(&mut self) {
        self.heads.fill(NIL);
        self.fl_bitmap = 0;
        self.sl_bitmaps = [0; FL_COUNT];
        self.used_words = 0;
        let size = self.words.len() as u32 - HEADER_WORDS;
        self.set_header(0, size, true);
        self.set_phys_prev(0, NIL);
        self.insert_free(0);
    }

    /// Deep clone of the arena and bookkeeping into `dest`. Every handle
    /// from `self` addresses the identical payload in `dest` afterwards.
    ///
    /// # Panics
    /// Panics when the destination capacity differs; snapshot allocators
    /// are sized identically by construction.
    pub fn copy_to(&self, dest: &mut Self) {
        assert_eq!(
            self.words.len(),
            dest.words.len(),
            "copy_to between differently sized arenas"
        );
        dest.words.copy_from_slice(&self.words);
        dest.heads.copy_from_slice(&self.heads);
        dest.fl_bitmap = self.fl_bitmap;
        dest.sl_bitmaps = self.sl_bitmaps;
        dest.used_words = self.used_words;
    }

    // --- payload access -------------------------------------------------

    /// Payload words of a live block.
    ///
    /// # Panics
    /// Panics on an invalid or freed handle.
    #[inline]
    #[must_use]
    pub fn payload(&self, handle: BlockHandle) -> &[u32] {
        let size = self.live_size(handle);
        &self.words[handle.0 as usize..(handle.0 + size) as usize]
    }

    /// Mutable payload words of a live block.
    #[inline]
    pub fn payload_mut(&mut self, handle: BlockHandle) -> &mut [u32] {
        let size = self.live_size(handle);
        &mut self.words[handle.0 as usize..(handle.0 + size) as usize]
    }

    /// Read one payload word, bounds-checked against the block.
    #[inline]
    #[must_use]
    pub fn word(&self, handle: BlockHandle, idx: u32) -> u32 {
        let size = self.live_size(handle);
        assert!(idx < size, "word index {idx} out of block of {size} words");
        self.words[(handle.0 + idx) as usize]
    }

    /// Write one payload word, bounds-checked against the block.
    #[inline]
    pub fn set_word(&mut self, handle: BlockHandle, idx: u32, value: u32) {
        let size = self.live_size(handle);
        assert!(idx < size, "word index {idx} out of block of {size} words");
        self.words[(handle.0 + idx) as usize] = value;
    }

    /// Granted payload size of a live block in words.
    #[inline]
    #[must_use]
    pub fn block_words(&self, handle: BlockHandle) -> u32 {
        self.live_size(handle)
    }

    #[inline(always)]
    fn live_size(&self, handle: BlockHandle) -> u32 {
        assert!(
            handle.is_valid() && handle.0 >= HEADER_WORDS && (handle.0 as usize) <= self.words.len(),
            "access through invalid handle"
        );
        let h = handle.0 - HEADER_WORDS;
        assert!(!self.is_free(h), "access through freed handle at {h}");
        self.size_of(h)
    }
}
