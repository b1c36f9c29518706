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

//! Long-string objects and the string hash table (§3 "Long-string
//! object", "String hash table"; §4.F "Long-string interning").
//!
//! ```text
//!  word 0   size | tag          (owned by the variable-length allocator)
//!  word 1   meta: kind | (payload_len << 8)
//!  word 2   refcount
//!  word 3   backlink list (reserved, mirrors the record header shape;
//!           long strings are released by refcount, never by backlink)
//!  word 4   offset of next long string in the same hash bucket
//!  word 5   offset of the secondary string, or 0
//!  ...      payload bytes
//! ```
//!
//! All mutation here runs under the caller's write lock (§5), same as
//! [`crate::mem::fixed`] and [`crate::mem::varlen`]; only the segment-wide
//! bump pointer inside `varlen::alloc` needs a CAS.

use std::sync::atomic::Ordering;

use crate::encoding::LongStrValue;
use crate::error::Result;
use crate::mem::atomic;
use crate::mem::segment::Segment;
use crate::mem::varlen;
use crate::util::hash::{bucket_index, long_string_hash};
use crate::util::{align8, WORD_SIZE};

const OFF_META: usize = WORD_SIZE;
const OFF_REFCOUNT: usize = 2 * WORD_SIZE;
const OFF_BACKLINK: usize = 3 * WORD_SIZE;
const OFF_HASHNEXT: usize = 4 * WORD_SIZE;
const OFF_SECONDARY: usize = 5 * WORD_SIZE;
const HEADER_WORDS: usize = 6;
pub const PAYLOAD_OFFSET: usize = HEADER_WORDS * WORD_SIZE;

fn make_meta(kind: u8, payload_len: usize) -> i64 {
    (kind as i64) | ((payload_len as i64) << 8)
}

fn meta_kind(meta: i64) -> u8 {
    (meta & 0xFF) as u8
}

fn meta_len(meta: i64) -> usize {
    (meta >> 8) as usize
}

/// Allocates a fresh long-string object, never checking the hash table for
/// an existing match (§4.F's "caller disables uniqueness" escape hatch).
pub fn create(seg: &Segment, kind: u8, payload: &[u8], secondary: Option<&[u8]>) -> Result<usize> {
    let secondary_offset = match secondary {
        Some(sec) => {
            let off = intern(seg, LONGSTR_TYPE_SECONDARY, sec, None)?;
            incref(seg, off);
            off
        }
        None => 0,
    };
    let total = align8(PAYLOAD_OFFSET + payload.len());
    let area = &seg.header().longstr_area;
    let offset = varlen::alloc(seg, area, total)?;
    unsafe {
        atomic::store(seg.base(), offset + OFF_META, make_meta(kind, payload.len()));
        atomic::store(seg.base(), offset + OFF_REFCOUNT, 0);
        atomic::store(seg.base(), offset + OFF_BACKLINK, 0);
        atomic::store(seg.base(), offset + OFF_HASHNEXT, 0);
        atomic::store(seg.base(), offset + OFF_SECONDARY, secondary_offset as i64);
    }
    let bytes = seg.bytes_mut();
    bytes[offset + PAYLOAD_OFFSET..offset + PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);
    Ok(offset)
}

/// The "secondary" slot (language tag, xsd type, URI prefix) is itself a
/// long string, but it never carries its own secondary and is tagged with
/// a reserved kind so it never collides with a real `Str`/`Uri`/`Xml`/`Blob`
/// value in the bucket-equality check.
const LONGSTR_TYPE_SECONDARY: u8 = 0xFF;

/// Hash-conses a long string: returns the offset of an existing object
/// with identical `(kind, payload, secondary)` if one is already in the
/// string hash table, otherwise allocates and links in a new one.
pub fn intern(seg: &Segment, kind: u8, payload: &[u8], secondary: Option<&[u8]>) -> Result<usize> {
    let h = &seg.header();
    let size = h.strhash_size.load(Ordering::SeqCst) as usize;
    if size == 0 {
        return create_and_link(seg, kind, payload, secondary);
    }
    let hash = long_string_hash(payload, secondary, kind);
    let bucket = bucket_index(hash, size);
    let table_offset = h.strhash_table.load(Ordering::SeqCst) as usize;
    let head_cell = table_offset + bucket * WORD_SIZE;

    let mut cursor = unsafe { atomic::load(seg.base(), head_cell) };
    while cursor != 0 {
        let offset = cursor as usize;
        if matches(seg, offset, kind, payload, secondary) {
            return Ok(offset);
        }
        cursor = unsafe { atomic::load(seg.base(), offset + OFF_HASHNEXT) };
    }
    create_and_link(seg, kind, payload, secondary)
}

fn create_and_link(seg: &Segment, kind: u8, payload: &[u8], secondary: Option<&[u8]>) -> Result<usize> {
    let offset = create(seg, kind, payload, secondary)?;
    link_into_bucket(seg, offset, kind, payload, secondary);
    Ok(offset)
}

fn link_into_bucket(seg: &Segment, offset: usize, kind: u8, payload: &[u8], secondary: Option<&[u8]>) {
    let h = seg.header();
    let size = h.strhash_size.load(Ordering::SeqCst) as usize;
    if size == 0 {
        return;
    }
    let hash = long_string_hash(payload, secondary, kind);
    let bucket = bucket_index(hash, size);
    let table_offset = h.strhash_table.load(Ordering::SeqCst) as usize;
    let head_cell = table_offset + bucket * WORD_SIZE;
    unsafe {
        let old_head = atomic::load(seg.base(), head_cell);
        atomic::store(seg.base(), offset + OFF_HASHNEXT, old_head);
        atomic::store(seg.base(), head_cell, offset as i64);
    }
}

fn matches(seg: &Segment, offset: usize, kind: u8, payload: &[u8], secondary: Option<&[u8]>) -> bool {
    let meta = unsafe { atomic::load(seg.base(), offset + OFF_META) };
    if meta_kind(meta) != kind || meta_len(meta) != payload.len() {
        return false;
    }
    let bytes = seg.bytes();
    if &bytes[offset + PAYLOAD_OFFSET..offset + PAYLOAD_OFFSET + payload.len()] != payload {
        return false;
    }
    let sec_offset = unsafe { atomic::load(seg.base(), offset + OFF_SECONDARY) };
    match (secondary, sec_offset) {
        (None, 0) => true,
        (None, _) | (Some(_), 0) => false,
        (Some(want), off) => read_payload(seg, off as usize) == want,
    }
}

fn read_payload(seg: &Segment, offset: usize) -> Vec<u8> {
    let meta = unsafe { atomic::load(seg.base(), offset + OFF_META) };
    let len = meta_len(meta);
    seg.bytes()[offset + PAYLOAD_OFFSET..offset + PAYLOAD_OFFSET + len].to_vec()
}

/// Reads a long string's full logical value out of the segment.
pub fn read(seg: &Segment, offset: usize) -> LongStrValue {
    let meta = unsafe { atomic::load(seg.base(), offset + OFF_META) };
    let kind = meta_kind(meta);
    let payload = read_payload(seg, offset);
    let sec_offset = unsafe { atomic::load(seg.base(), offset + OFF_SECONDARY) };
    let secondary = if sec_offset == 0 {
        None
    } else {
        Some(read_payload(seg, sec_offset as usize))
    };
    LongStrValue {
        kind,
        payload,
        secondary,
    }
}

/// Increments a long string's reference count, called whenever a field
/// comes to hold an encoded reference to it (§4.F "Refcount discipline").
pub fn incref(seg: &Segment, offset: usize) -> i64 {
    unsafe { atomic::atomic_inc(seg.base(), offset + OFF_REFCOUNT, 1) }
}

/// Decrements a long string's reference count; at zero, unlinks it from
/// its hash bucket, releases its secondary string (if any), and returns
/// its storage to the long-string area.
pub fn release(seg: &Segment, offset: usize) {
    let new_count = unsafe { atomic::atomic_inc(seg.base(), offset + OFF_REFCOUNT, -1) };
    debug_assert!(new_count >= 0, "long string refcount underflow");
    if new_count > 0 {
        return;
    }
    unlink_from_bucket(seg, offset);
    let sec_offset = unsafe { atomic::load(seg.base(), offset + OFF_SECONDARY) };
    if sec_offset != 0 {
        release(seg, sec_offset as usize);
    }
    let _ = varlen::free(seg, &seg.header().longstr_area, offset);
}

fn unlink_from_bucket(seg: &Segment, offset: usize) {
    let h = seg.header();
    let size = h.strhash_size.load(Ordering::SeqCst) as usize;
    if size == 0 {
        return;
    }
    let value = read_payload(seg, offset);
    let meta = unsafe { atomic::load(seg.base(), offset + OFF_META) };
    let kind = meta_kind(meta);
    let sec_offset = unsafe { atomic::load(seg.base(), offset + OFF_SECONDARY) };
    let secondary = if sec_offset == 0 {
        None
    } else {
        Some(read_payload(seg, sec_offset as usize))
    };
    let hash = long_string_hash(&value, secondary.as_deref(), kind);
    let bucket = bucket_index(hash, size);
    let table_offset = h.strhash_table.load(Ordering::SeqCst) as usize;
    let head_cell = table_offset + bucket * WORD_SIZE;

    let mut prev_cell = head_cell;
    let mut cursor = unsafe { atomic::load(seg.base(), head_cell) };
    while cursor != 0 {
        let cur_offset = cursor as usize;
        let next = unsafe { atomic::load(seg.base(), cur_offset + OFF_HASHNEXT) };
        if cur_offset == offset {
            unsafe { atomic::store(seg.base(), prev_cell, next) };
            return;
        }
        prev_cell = cur_offset + OFF_HASHNEXT;
        cursor = next;
    }
}

#[cfg(test)]
mod test_strtable {
    use super::*;
    use crate::encoding::LONGSTR_TYPE_STR;
    use crate::mem::segment::Segment;

    #[test]
    fn test_intern_dedupes_equal_strings() {
        let seg = Segment::attach_local(512 * 1024).unwrap();
        let a = intern(&seg, LONGSTR_TYPE_STR, b"hello world", None).unwrap();
        let b = intern(&seg, LONGSTR_TYPE_STR, b"hello world", None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_intern_distinguishes_kind() {
        let seg = Segment::attach_local(512 * 1024).unwrap();
        let a = intern(&seg, LONGSTR_TYPE_STR, b"same", None).unwrap();
        let b = intern(&seg, crate::encoding::LONGSTR_TYPE_URI, b"same", None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_intern_distinguishes_secondary() {
        let seg = Segment::attach_local(512 * 1024).unwrap();
        let a = intern(&seg, LONGSTR_TYPE_STR, b"bonjour", Some(b"fr")).unwrap();
        let b = intern(&seg, LONGSTR_TYPE_STR, b"bonjour", Some(b"en")).unwrap();
        assert_ne!(a, b);
        assert_eq!(read(&seg, a).secondary.unwrap(), b"fr");
    }

    #[test]
    fn test_create_without_intern_allocates_fresh_each_time() {
        let seg = Segment::attach_local(512 * 1024).unwrap();
        let a = create(&seg, LONGSTR_TYPE_STR, b"dup", None).unwrap();
        let b = create(&seg, LONGSTR_TYPE_STR, b"dup", None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_incref_decref_frees_at_zero() {
        let seg = Segment::attach_local(512 * 1024).unwrap();
        let a = intern(&seg, LONGSTR_TYPE_STR, b"owned-once", None).unwrap();
        incref(&seg, a);
        release(&seg, a);
        // the object was unlinked from its hash bucket and returned to the
        // area (its slot may well be reused by the designated victim, so
        // this only asserts interning still works and reads back cleanly,
        // not that the offset changed).
        let b = intern(&seg, LONGSTR_TYPE_STR, b"owned-once", None).unwrap();
        assert_eq!(read(&seg, b).payload, b"owned-once");
    }

    #[test]
    fn test_release_cascades_to_secondary() {
        let seg = Segment::attach_local(512 * 1024).unwrap();
        let a = intern(&seg, LONGSTR_TYPE_STR, b"tagged", Some(b"en")).unwrap();
        incref(&seg, a);
        let _sec_offset = unsafe { atomic::load(seg.base(), a + OFF_SECONDARY) } as usize;
        release(&seg, a);
        // the parent's only reference is gone, so its secondary's matching
        // reference was released too: re-interning "en" must succeed and
        // read back cleanly, whether or not its storage is recycled at the
        // same offset.
        let fresh_en = intern(&seg, LONGSTR_TYPE_SECONDARY, b"en", None).unwrap();
        assert_eq!(read(&seg, fresh_en).payload, b"en");
    }
}
