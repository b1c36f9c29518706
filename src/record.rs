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

//! Record operations (§4.G): create, delete, field get/set, and the
//! backlink chain that tracks which records hold a reference to which.
//!
//! ```text
//!  word 0   size | tag           (owned by the variable-length allocator)
//!  word 1   meta: class | (field_count << 8)
//!  word 2   offset of the first backlink list cell, or 0
//!  word 3.. one tagged word per field
//! ```
//!
//! Journaling and lock acquisition are not threaded through these
//! functions: they operate purely on the segment, so the orchestration
//! layer (`db`) can bracket a call here with a write lock and a journal
//! entry without this module needing to know either exists. The index
//! collaborator is the one cross-cutting concern record ops do call
//! directly, since §4.G's own wording ("indexes all NULL fields via the
//! index collaborator") makes that notification part of the operation's
//! definition rather than something layered on from outside.

use std::thread;
use std::time::Duration;

use crate::encoding::{self, Decoded};
use crate::error::{DbError, Result, Status};
use crate::index::IndexCollaborator;
use crate::mem::atomic;
use crate::mem::objhdr::{TAG_USED, TAG_USED_PREV_FREE};
use crate::mem::segment::Segment;
use crate::mem::{fixed, varlen};
use crate::util::{align8, WORD_SIZE};

const HEADER_WORDS: usize = 3;
const OFF_META: usize = WORD_SIZE;
const OFF_BACKLINK: usize = 2 * WORD_SIZE;
const OFF_FIELDS: usize = HEADER_WORDS * WORD_SIZE;

const LC_NEXT: usize = 0;
const LC_PARENT: usize = WORD_SIZE;

/// Re-indexing after `set_field` walks backlinked ancestors up to this
/// many hops (§9).
const REINDEX_MAX_DEPTH: usize = crate::index::REINDEX_MAX_DEPTH;

/// A record's coarse kind, carried in its meta word. The query/index
/// layers above this module (out of scope here) distinguish these;
/// record ops themselves treat every class identically.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(i64)]
pub enum RecordClass {
    Data = 0,
    Special = 1,
    Match = 2,
    Document = 3,
    Object = 4,
    Array = 5,
}

fn make_meta(class: RecordClass, field_count: usize) -> i64 {
    (class as i64) | ((field_count as i64) << 8)
}

fn meta_field_count(meta: i64) -> usize {
    (meta >> 8) as usize
}

fn bad(msg: &str) -> DbError {
    DbError::new(Status::BadArgument, Some(msg))
}

fn field_offset(rec: usize, col: usize) -> usize {
    rec + OFF_FIELDS + col * WORD_SIZE
}

/// Number of fields a live record was created with.
pub fn field_count(seg: &Segment, rec: usize) -> usize {
    let meta = unsafe { atomic::load(seg.base(), rec + OFF_META) };
    meta_field_count(meta)
}

fn check_col(seg: &Segment, rec: usize, col: usize) -> Result<()> {
    if col >= field_count(seg, rec) {
        return Err(bad("column index out of range for this record"));
    }
    Ok(())
}

/// Raw tagged word currently stored in `rec`'s field `col`.
pub fn get_field(seg: &Segment, rec: usize, col: usize) -> Result<i64> {
    check_col(seg, rec, col)?;
    Ok(unsafe { atomic::load(seg.base(), field_offset(rec, col)) })
}

/// Allocates `header_words + n` words from the data area, zero-initializes
/// every field, and notifies the index collaborator once per field since
/// every field starts out NULL (§4.G `create`).
pub fn create(seg: &Segment, index: &dyn IndexCollaborator, n: usize) -> Result<usize> {
    let rec = create_raw(seg, n)?;
    for col in 0..n {
        index.on_create(seg, rec, col)?;
    }
    Ok(rec)
}

/// Same as [`create`] but does not notify the index collaborator; the
/// caller must populate every slot with [`set_new_field`] (§4.G
/// `create_raw`).
pub fn create_raw(seg: &Segment, n: usize) -> Result<usize> {
    let total = align8((HEADER_WORDS + n) * WORD_SIZE);
    let offset = varlen::alloc(seg, &seg.header().data_area, total)?;
    unsafe {
        atomic::store(seg.base(), offset + OFF_META, make_meta(RecordClass::Data, n));
        atomic::store(seg.base(), offset + OFF_BACKLINK, 0);
        for col in 0..n {
            atomic::store(seg.base(), field_offset(offset, col), 0);
        }
    }
    Ok(offset)
}

/// Deletes `rec`: fails if anything still references it, otherwise
/// removes it from indexes, releases every heap value and backlink its
/// fields hold, and returns the object to the data area (§4.G `delete`).
pub fn delete(seg: &Segment, rec: usize, index: &dyn IndexCollaborator) -> Result<()> {
    let backlink_head = unsafe { atomic::load(seg.base(), rec + OFF_BACKLINK) };
    if backlink_head != 0 {
        return Err(DbError::new(
            Status::BacklinkViolation,
            Some("cannot delete a record still referenced by another record's field"),
        ));
    }
    let n = field_count(seg, rec);
    for col in 0..n {
        let value = unsafe { atomic::load(seg.base(), field_offset(rec, col)) };
        index.on_delete(seg, rec, col, value)?;
    }
    for col in 0..n {
        let value = unsafe { atomic::load(seg.base(), field_offset(rec, col)) };
        release_old_value(seg, rec, value)?;
    }
    varlen::free(seg, &seg.header().data_area, rec)
}

/// Writes `new` into a slot that is known to hold NULL, skipping the
/// old-value handling `set_field` performs (§4.G `set_new_field`).
pub fn set_new_field(
    seg: &Segment,
    rec: usize,
    col: usize,
    new: i64,
    index: &dyn IndexCollaborator,
) -> Result<()> {
    check_col(seg, rec, col)?;
    let offset = field_offset(rec, col);
    let current = unsafe { atomic::load(seg.base(), offset) };
    if current != 0 {
        return Err(bad("set_new_field called on a slot that is not NULL"));
    }
    unsafe { atomic::store(seg.base(), offset, new) };
    link_new_value(seg, rec, new)?;
    index.on_insert(seg, rec, col, new)?;
    Ok(())
}

/// Overwrites `rec`'s field `col` with `new`, unwinding the old value's
/// refcount/backlink and linking the new one, re-inserting into indexes,
/// and re-indexing ancestors up to [`REINDEX_MAX_DEPTH`] hops since their
/// comparison value just changed transitively (§4.G `set_field`).
pub fn set_field(
    seg: &Segment,
    rec: usize,
    col: usize,
    new: i64,
    index: &dyn IndexCollaborator,
) -> Result<()> {
    check_col(seg, rec, col)?;
    let offset = field_offset(rec, col);
    let old = unsafe { atomic::load(seg.base(), offset) };
    index.on_remove(seg, rec, col, old)?;
    release_old_value(seg, rec, old)?;
    unsafe { atomic::store(seg.base(), offset, new) };
    link_new_value(seg, rec, new)?;
    index.on_insert(seg, rec, col, new)?;
    reindex_ancestors(seg, rec, col, index, REINDEX_MAX_DEPTH)?;
    Ok(())
}

fn reindex_ancestors(
    seg: &Segment,
    rec: usize,
    col: usize,
    index: &dyn IndexCollaborator,
    depth: usize,
) -> Result<()> {
    if depth == 0 {
        return Ok(());
    }
    let mut cursor = unsafe { atomic::load(seg.base(), rec + OFF_BACKLINK) };
    while cursor != 0 {
        let cell = cursor as usize;
        let parent = unsafe { atomic::load(seg.base(), cell + LC_PARENT) } as usize;
        index.on_reindex_ancestor(seg, parent, col)?;
        reindex_ancestors(seg, parent, col, index, depth - 1)?;
        cursor = unsafe { atomic::load(seg.base(), cell + LC_NEXT) };
    }
    Ok(())
}

fn link_new_value(seg: &Segment, holder: usize, word: i64) -> Result<()> {
    match encoding::decode(word) {
        Decoded::RecordRef(target) => add_backlink(seg, target, holder),
        Decoded::LongStr(off) => {
            encoding::strtable::incref(seg, off);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn release_old_value(seg: &Segment, holder: usize, word: i64) -> Result<()> {
    match encoding::decode(word) {
        Decoded::RecordRef(target) => remove_one_backlink(seg, target, holder),
        _ => {
            encoding::free_heap_value(seg, word);
            Ok(())
        }
    }
}

fn add_backlink(seg: &Segment, target: usize, holder: usize) -> Result<()> {
    let cell = fixed::alloc(seg, &seg.header().listcell_area)?;
    unsafe {
        atomic::store(seg.base(), cell + LC_PARENT, holder as i64);
        let old_head = atomic::load(seg.base(), target + OFF_BACKLINK);
        atomic::store(seg.base(), cell + LC_NEXT, old_head);
        atomic::store(seg.base(), target + OFF_BACKLINK, cell as i64);
    }
    Ok(())
}

fn remove_one_backlink(seg: &Segment, target: usize, holder: usize) -> Result<()> {
    let mut patch_at = target + OFF_BACKLINK;
    let mut cursor = unsafe { atomic::load(seg.base(), patch_at) };
    while cursor != 0 {
        let cell = cursor as usize;
        let parent = unsafe { atomic::load(seg.base(), cell + LC_PARENT) };
        let next = unsafe { atomic::load(seg.base(), cell + LC_NEXT) };
        if parent == holder as i64 {
            unsafe { atomic::store(seg.base(), patch_at, next) };
            fixed::free(seg, &seg.header().listcell_area, cell);
            return Ok(());
        }
        patch_at = cell + LC_NEXT;
        cursor = next;
    }
    Err(DbError::new(
        Status::BacklinkViolation,
        Some("target's backlink chain did not contain the expected holder"),
    ))
}

/// Offset of the first live record in the data area, or `None` if the
/// area holds none (§4.G `get_first`).
pub fn get_first(seg: &Segment) -> Option<usize> {
    let area = &seg.header().data_area;
    let count = area.subarea_count.load(std::sync::atomic::Ordering::SeqCst) as usize;
    if count == 0 {
        return None;
    }
    let start = area.subareas[0].offset.load(std::sync::atomic::Ordering::SeqCst) as usize;
    scan_forward(seg, start)
}

/// Offset of the next live record after `rec`, or `None` at the end of
/// the data area (§4.G `get_next`).
pub fn get_next(seg: &Segment, rec: usize) -> Option<usize> {
    let (size, _) = varlen::header_at(seg, rec);
    next_offset_after(seg, rec, size).and_then(|off| scan_forward(seg, off))
}

fn scan_forward(seg: &Segment, mut off: usize) -> Option<usize> {
    loop {
        let (size, tag) = varlen::header_at(seg, off);
        if tag == TAG_USED || tag == TAG_USED_PREV_FREE {
            return Some(off);
        }
        off = next_offset_after(seg, off, size)?;
    }
}

/// Advances past the object of `size` bytes at `off`, crossing into the
/// next sub-area of the data area if `off` was the last thing before its
/// sub-area's end sentinel.
fn next_offset_after(seg: &Segment, off: usize, size: usize) -> Option<usize> {
    use std::sync::atomic::Ordering;
    let area = &seg.header().data_area;
    let count = area.subarea_count.load(Ordering::SeqCst) as usize;
    for i in 0..count {
        let sub_off = area.subareas[i].offset.load(Ordering::SeqCst) as usize;
        let sub_size = area.subareas[i].size.load(Ordering::SeqCst) as usize;
        if off >= sub_off && off < sub_off + sub_size {
            let candidate = off + size;
            if candidate < sub_off + sub_size {
                return Some(candidate);
            }
            return if i + 1 < count {
                Some(area.subareas[i + 1].offset.load(Ordering::SeqCst) as usize)
            } else {
                None
            };
        }
    }
    None
}

const ATOMIC_RETRY_LIMIT: u32 = 1000;
const ATOMIC_RETRY_SLEEP: Duration = Duration::from_micros(20);

/// CAS-based field update: permitted only between two immediate values
/// (§4.G `update_atomic_field`). Whether `col` is indexed and whether the
/// segment journals are policy decisions the caller must already have
/// enforced, since record ops have no notion of "this column is indexed"
/// on their own.
pub fn update_atomic_field(seg: &Segment, rec: usize, col: usize, new: i64, expected: i64) -> Result<()> {
    check_col(seg, rec, col)?;
    if encoding::is_heap_reference(new) || encoding::is_heap_reference(expected) {
        return Err(bad("update_atomic_field requires immediate values"));
    }
    let offset = field_offset(rec, col);
    if unsafe { atomic::cas(seg.base(), offset, expected, new) } {
        Ok(())
    } else {
        Err(DbError::new(Status::CasFailure, Some("field no longer held the expected value")))
    }
}

/// Loops `update_atomic_field` against the field's current value until it
/// wins, sleeping briefly after every tenth failed attempt, giving up
/// after 1000 tries (§4.G `set_atomic_field`).
pub fn set_atomic_field(seg: &Segment, rec: usize, col: usize, new: i64) -> Result<()> {
    check_col(seg, rec, col)?;
    if encoding::is_heap_reference(new) {
        return Err(bad("set_atomic_field requires an immediate value"));
    }
    let offset = field_offset(rec, col);
    for attempt in 0..ATOMIC_RETRY_LIMIT {
        let current = unsafe { atomic::load(seg.base(), offset) };
        if encoding::is_heap_reference(current) {
            return Err(bad("set_atomic_field requires an immediate-valued column"));
        }
        if unsafe { atomic::cas(seg.base(), offset, current, new) } {
            return Ok(());
        }
        if attempt % 10 == 9 {
            warn!("set_atomic_field: {} CAS retries on rec {} col {}", attempt + 1, rec, col);
            thread::sleep(ATOMIC_RETRY_SLEEP);
        }
    }
    Err(DbError::new(
        Status::RetryExhausted,
        Some("set_atomic_field exhausted its retry budget (deadlock suspected)"),
    ))
}

/// Adds `delta` to a small-int field via CAS retry, returning the new
/// value (§4.G `add_int_atomic_field`).
pub fn add_int_atomic_field(seg: &Segment, rec: usize, col: usize, delta: i64) -> Result<i64> {
    check_col(seg, rec, col)?;
    let offset = field_offset(rec, col);
    for attempt in 0..ATOMIC_RETRY_LIMIT {
        let current = unsafe { atomic::load(seg.base(), offset) };
        let v = match encoding::decode(current) {
            Decoded::SmallInt(v) => v,
            _ => return Err(bad("add_int_atomic_field requires an immediate small-int field")),
        };
        let new_v = v
            .checked_add(delta)
            .ok_or_else(|| bad("add_int_atomic_field overflowed the small-int range"))?;
        let new_word =
            encoding::encode_small_int(new_v).ok_or_else(|| bad("add_int_atomic_field result exceeds small-int range"))?;
        if unsafe { atomic::cas(seg.base(), offset, current, new_word) } {
            return Ok(new_v);
        }
        if attempt % 10 == 9 {
            warn!("add_int_atomic_field: {} CAS retries on rec {} col {}", attempt + 1, rec, col);
            thread::sleep(ATOMIC_RETRY_SLEEP);
        }
    }
    Err(DbError::new(
        Status::RetryExhausted,
        Some("add_int_atomic_field exhausted its retry budget (deadlock suspected)"),
    ))
}

#[cfg(test)]
mod test_record {
    use super::*;
    use crate::index::NullIndex;
    use crate::mem::segment::Segment;

    fn fresh() -> Segment {
        Segment::attach_local(512 * 1024).unwrap()
    }

    #[test]
    fn test_create_zero_initializes_fields() {
        let seg = fresh();
        let rec = create(&seg, &NullIndex, 4).unwrap();
        assert_eq!(field_count(&seg, rec), 4);
        for col in 0..4 {
            assert_eq!(get_field(&seg, rec, col).unwrap(), 0);
        }
    }

    #[test]
    fn test_set_field_then_get_small_int() {
        let seg = fresh();
        let rec = create(&seg, &NullIndex, 2).unwrap();
        let w = encoding::encode_small_int(42).unwrap();
        set_field(&seg, rec, 0, w, &NullIndex).unwrap();
        assert_eq!(get_field(&seg, rec, 0).unwrap(), w);
    }

    #[test]
    fn test_set_new_field_rejects_non_null_slot() {
        let seg = fresh();
        let rec = create(&seg, &NullIndex, 1).unwrap();
        let w = encoding::encode_small_int(1).unwrap();
        set_new_field(&seg, rec, 0, w, &NullIndex).unwrap();
        let err = set_new_field(&seg, rec, 0, w, &NullIndex).unwrap_err();
        assert_eq!(err.status(), Status::BadArgument);
    }

    #[test]
    fn test_delete_frees_record() {
        let seg = fresh();
        let rec = create(&seg, &NullIndex, 2).unwrap();
        delete(&seg, rec, &NullIndex).unwrap();
        let rec2 = create(&seg, &NullIndex, 2).unwrap();
        assert_eq!(rec, rec2, "freed record slot should be reused");
    }

    #[test]
    fn test_delete_fails_with_nonempty_backlink() {
        let seg = fresh();
        let target = create(&seg, &NullIndex, 0).unwrap();
        let holder = create(&seg, &NullIndex, 1).unwrap();
        set_field(&seg, holder, 0, encoding::encode_record_ref(target), &NullIndex).unwrap();
        let err = delete(&seg, target, &NullIndex).unwrap_err();
        assert_eq!(err.status(), Status::BacklinkViolation);
    }

    #[test]
    fn test_record_ref_backlink_created_and_removed() {
        let seg = fresh();
        let target = create(&seg, &NullIndex, 0).unwrap();
        let holder = create(&seg, &NullIndex, 1).unwrap();
        set_field(&seg, holder, 0, encoding::encode_record_ref(target), &NullIndex).unwrap();
        assert_ne!(
            unsafe { atomic::load(seg.base(), target + OFF_BACKLINK) },
            0
        );
        set_field(&seg, holder, 0, encoding::encode_null(), &NullIndex).unwrap();
        assert_eq!(
            unsafe { atomic::load(seg.base(), target + OFF_BACKLINK) },
            0
        );
        delete(&seg, target, &NullIndex).unwrap();
    }

    #[test]
    fn test_long_string_field_refcounted_on_overwrite() {
        let seg = fresh();
        let rec = create(&seg, &NullIndex, 1).unwrap();
        let w = encoding::encode_long_str(&seg, encoding::LONGSTR_TYPE_STR, b"hello", None, true).unwrap();
        set_field(&seg, rec, 0, w, &NullIndex).unwrap();
        // overwriting with NULL releases the long string's only reference;
        // re-interning the same bytes must still succeed and read back
        // correctly (its storage may or may not be recycled at the same
        // offset, so this doesn't assert either way).
        set_field(&seg, rec, 0, encoding::encode_null(), &NullIndex).unwrap();
        let w2 = encoding::encode_long_str(&seg, encoding::LONGSTR_TYPE_STR, b"hello", None, true).unwrap();
        match encoding::decode(w2) {
            Decoded::LongStr(off) => assert_eq!(encoding::decode_long_str(&seg, off).payload, b"hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_get_first_get_next_walks_records_skipping_frees() {
        let seg = fresh();
        let a = create(&seg, &NullIndex, 1).unwrap();
        let b = create(&seg, &NullIndex, 1).unwrap();
        let c = create(&seg, &NullIndex, 1).unwrap();
        delete(&seg, b, &NullIndex).unwrap();
        let first = get_first(&seg).unwrap();
        assert_eq!(first, a);
        let next = get_next(&seg, first).unwrap();
        assert_eq!(next, c);
        assert!(get_next(&seg, next).is_none());
    }

    #[test]
    fn test_update_atomic_field_cas_success_and_failure() {
        let seg = fresh();
        let rec = create(&seg, &NullIndex, 1).unwrap();
        let zero = encoding::encode_small_int(0).unwrap();
        let one = encoding::encode_small_int(1).unwrap();
        update_atomic_field(&seg, rec, 0, one, zero).unwrap();
        let err = update_atomic_field(&seg, rec, 0, zero, zero).unwrap_err();
        assert_eq!(err.status(), Status::CasFailure);
    }

    #[test]
    fn test_update_atomic_field_rejects_heap_values() {
        let seg = fresh();
        let rec = create(&seg, &NullIndex, 1).unwrap();
        let heap = encoding::encode_record_ref(4096);
        let zero = encoding::encode_small_int(0).unwrap();
        let err = update_atomic_field(&seg, rec, 0, heap, zero).unwrap_err();
        assert_eq!(err.status(), Status::BadArgument);
    }

    #[test]
    fn test_set_atomic_field_overwrites_unconditionally() {
        let seg = fresh();
        let rec = create(&seg, &NullIndex, 1).unwrap();
        let five = encoding::encode_small_int(5).unwrap();
        set_atomic_field(&seg, rec, 0, five).unwrap();
        assert_eq!(get_field(&seg, rec, 0).unwrap(), five);
    }

    #[test]
    fn test_add_int_atomic_field_accumulates() {
        let seg = fresh();
        let rec = create(&seg, &NullIndex, 1).unwrap();
        let zero = encoding::encode_small_int(0).unwrap();
        set_atomic_field(&seg, rec, 0, zero).unwrap();
        let v1 = add_int_atomic_field(&seg, rec, 0, 5).unwrap();
        let v2 = add_int_atomic_field(&seg, rec, 0, -2).unwrap();
        assert_eq!(v1, 5);
        assert_eq!(v2, 3);
    }

    #[test]
    fn test_concurrent_add_int_atomic_field_is_exact() {
        use std::sync::Arc;
        use std::thread as std_thread;

        let seg = Arc::new(fresh());
        let rec = create(&seg, &NullIndex, 1).unwrap();
        set_atomic_field(&seg, rec, 0, encoding::encode_small_int(0).unwrap()).unwrap();
        let mut handles = vec![];
        for _ in 0..8 {
            let seg = Arc::clone(&seg);
            handles.push(std_thread::spawn(move || {
                for _ in 0..50 {
                    add_int_atomic_field(&seg, rec, 0, 1).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        match encoding::decode(get_field(&seg, rec, 0).unwrap()) {
            Decoded::SmallInt(v) => assert_eq!(v, 400),
            other => panic!("unexpected {:?}", other),
        }
    }
}
