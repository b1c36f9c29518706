// Copyright 2019 Fullstop000 <fullstop1005@gmail.com>.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

//! Object header conventions shared by the variable-length allocator and
//! by record traversal (§3 "Object header conventions").
//!
//! ```text
//!  word 0          word 1        word 2        ... last word
//! ┌──────────────┬─────────────┬─────────────┬─────┬──────────────┐
//! │ size | tag    │ next (free) │ prev (free) │ ... │ size | tag   │ (boundary tag,
//! └──────────────┴─────────────┴─────────────┴─────┴──────────────┘  free objects only)
//! ```
//!
//! `size` always occupies every bit of the header word except the low 2,
//! which is safe because every object size is 8-byte aligned and so
//! never sets those bits itself.

use crate::mem::atomic;

pub const TAG_USED: i64 = 0b00;
pub const TAG_USED_PREV_FREE: i64 = 0b10;
pub const TAG_FREE: i64 = 0b01;
pub const TAG_SPECIAL: i64 = 0b11;
const TAG_MASK: i64 = 0b11;

/// Minimum object size: 4 machine words (header, next, prev, boundary
/// tag), also the size of every sentinel.
pub const MIN_OBJECT_SIZE: usize = 32;

#[inline]
pub fn size_of_header(word: i64) -> usize {
    (word & !TAG_MASK) as usize
}

#[inline]
pub fn tag_of_header(word: i64) -> i64 {
    word & TAG_MASK
}

#[inline]
pub fn make_header(size: usize, tag: i64) -> i64 {
    debug_assert_eq!(size & 0b111, 0, "object size must be 8-byte aligned");
    (size as i64 & !TAG_MASK) | tag
}

#[inline]
pub unsafe fn read_header(base: *mut u8, offset: usize) -> i64 {
    atomic::load(base, offset)
}

#[inline]
pub unsafe fn write_header(base: *mut u8, offset: usize, size: usize, tag: i64) {
    atomic::store(base, offset, make_header(size, tag));
}

/// Flips a neighbouring in-use object's "previous neighbour is free" bit
/// on (`00 -> 10`). No-op on special objects, which never carry this bit.
pub unsafe fn mark_prev_free(base: *mut u8, offset: usize) {
    let h = atomic::load(base, offset);
    if tag_of_header(h) == TAG_USED {
        let size = size_of_header(h);
        write_header(base, offset, size, TAG_USED_PREV_FREE);
    }
}

/// Flips a neighbouring in-use object's "previous neighbour is free" bit
/// off (`10 -> 00`), called after the free predecessor has been consumed
/// by an allocation.
pub unsafe fn mark_prev_used(base: *mut u8, offset: usize) {
    let h = atomic::load(base, offset);
    if tag_of_header(h) == TAG_USED_PREV_FREE {
        let size = size_of_header(h);
        write_header(base, offset, size, TAG_USED);
    }
}

#[cfg(test)]
mod test_objhdr {
    use super::*;

    #[test]
    fn test_make_and_decode_header() {
        let h = make_header(256, TAG_FREE);
        assert_eq!(size_of_header(h), 256);
        assert_eq!(tag_of_header(h), TAG_FREE);
    }

    #[test]
    fn test_all_tags_survive_roundtrip() {
        for tag in [TAG_USED, TAG_USED_PREV_FREE, TAG_FREE, TAG_SPECIAL] {
            let h = make_header(64, tag);
            assert_eq!(tag_of_header(h), tag);
            assert_eq!(size_of_header(h), 64);
        }
    }
}
