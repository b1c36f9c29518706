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

//! Variable-length allocator: bucketed freelists, a designated victim,
//! and boundary-tag coalescing (§4.E). Used for data records, long
//! strings, and index hash storage.
//!
//! # Bucket layout
//!
//! `EXACT` buckets hold free objects of one exact word-size each
//! (`exact[i]` only ever contains objects of `i` words); `VAR` buckets
//! hold power-of-two *ranges* of word-sizes starting at 256 words. The
//! single designated victim (DV) lives outside both arrays, in
//! `dv_offset`/`dv_size`; it is never linked into a freelist.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{DbError, Result, Status};
use crate::mem::atomic;
use crate::mem::objhdr::{
    make_header, mark_prev_free, mark_prev_used, read_header, size_of_header, tag_of_header,
    write_header, MIN_OBJECT_SIZE, TAG_FREE, TAG_SPECIAL, TAG_USED,
};
use crate::mem::segment::{Segment, VarAreaHeader, EXACT_BUCKETS, MAX_SUBAREAS, VAR_BUCKETS};
use crate::mem::subarea;
use crate::util::{align8, WORD_SIZE};

/// `freebuckets_index(size)` of §4.E, operating on a size already
/// expressed in words.
fn freebuckets_index(size_words: usize) -> usize {
    if size_words < EXACT_BUCKETS {
        size_words
    } else {
        let ratio = size_words / EXACT_BUCKETS;
        let log2 = (usize::BITS - 1 - ratio.leading_zeros()) as usize;
        EXACT_BUCKETS + log2
    }
}

fn bucket_head(area: &VarAreaHeader, size_bytes: usize) -> &AtomicI64 {
    let idx = freebuckets_index(size_bytes / WORD_SIZE);
    if idx < EXACT_BUCKETS {
        &area.exact[idx]
    } else {
        let var_idx = (idx - EXACT_BUCKETS).min(VAR_BUCKETS - 1);
        &area.var[var_idx]
    }
}

fn align_request(wanted_bytes: usize) -> usize {
    align8(wanted_bytes).max(MIN_OBJECT_SIZE)
}

/// Pushes a free object (header already sized, but not yet tagged free)
/// onto the head of its bucket, writing its freelist links and boundary
/// tag.
unsafe fn push_to_bucket(seg: &Segment, area: &VarAreaHeader, offset: usize, size: usize) {
    let head_cell = bucket_head(area, size);
    let old_head = head_cell.load(Ordering::SeqCst);
    write_header(seg.base(), offset, size, TAG_FREE);
    atomic::store(seg.base(), offset + WORD_SIZE, old_head);
    atomic::store(seg.base(), offset + 2 * WORD_SIZE, 0);
    write_header(seg.base(), offset + size - WORD_SIZE, size, TAG_FREE);
    if old_head != 0 {
        atomic::store(seg.base(), old_head as usize + 2 * WORD_SIZE, offset as i64);
    }
    head_cell.store(offset as i64, Ordering::SeqCst);
}

/// Removes a known free object from its bucket given its current size.
unsafe fn unlink_from_bucket(seg: &Segment, area: &VarAreaHeader, offset: usize, size: usize) {
    let head_cell = bucket_head(area, size);
    let next = atomic::load(seg.base(), offset + WORD_SIZE);
    let prev = atomic::load(seg.base(), offset + 2 * WORD_SIZE);
    if prev != 0 {
        atomic::store(seg.base(), prev as usize + WORD_SIZE, next);
    } else {
        head_cell.store(next, Ordering::SeqCst);
    }
    if next != 0 {
        atomic::store(seg.base(), next as usize + 2 * WORD_SIZE, prev);
    }
}

/// Walks a bucket's freelist looking for an exact-size match, falling
/// back to the first entry that leaves a splittable remainder.
unsafe fn find_in_bucket(seg: &Segment, head: i64, wanted: usize) -> Option<(usize, usize, bool)> {
    let mut cursor = head;
    let mut fallback = None;
    while cursor != 0 {
        let offset = cursor as usize;
        let size = size_of_header(read_header(seg.base(), offset));
        if size == wanted {
            return Some((offset, size, true));
        }
        if fallback.is_none() && size >= wanted + MIN_OBJECT_SIZE {
            fallback = Some((offset, size, false));
        }
        cursor = atomic::load(seg.base(), offset + WORD_SIZE);
    }
    fallback
}

/// Splits a free object found at `offset`/`total_size` into a used low
/// half of `wanted` bytes and a free remainder, pushing the remainder to
/// its own bucket. Returns the used offset.
unsafe fn split_and_use(seg: &Segment, area: &VarAreaHeader, offset: usize, total_size: usize, wanted: usize) -> usize {
    write_header(seg.base(), offset, wanted, TAG_USED);
    let remainder_offset = offset + wanted;
    let remainder_size = total_size - wanted;
    push_to_bucket(seg, area, remainder_offset, remainder_size);
    offset
}

/// Allocates `wanted_bytes` from a variable-length area, implementing
/// the five-step search of §4.E.
pub fn alloc(seg: &Segment, area: &VarAreaHeader, wanted_bytes: usize) -> Result<usize> {
    let wanted = align_request(wanted_bytes);
    trace!("varlen::alloc: wanted_bytes={} aligned_words={}", wanted_bytes, wanted / WORD_SIZE);
    unsafe {
        // Step 1: direct exact-bucket hit.
        if wanted / WORD_SIZE < EXACT_BUCKETS {
            let head_cell = &area.exact[wanted / WORD_SIZE];
            let head = head_cell.load(Ordering::SeqCst);
            if head != 0 {
                let offset = head as usize;
                unlink_from_bucket(seg, area, offset, wanted);
                write_header(seg.base(), offset, wanted, TAG_USED);
                mark_prev_used(seg.base(), offset + wanted);
                return Ok(offset);
            }
        }

        // Step 2: scan the next few exact buckets (bounded) for a
        // splittable block.
        let base_idx = wanted / WORD_SIZE;
        for idx in (base_idx + 1)..=(base_idx + 3).min(EXACT_BUCKETS - 1) {
            if idx >= EXACT_BUCKETS {
                break;
            }
            let head = area.exact[idx].load(Ordering::SeqCst);
            if head == 0 {
                continue;
            }
            let offset = head as usize;
            let size = idx * WORD_SIZE;
            if size >= wanted + MIN_OBJECT_SIZE {
                unlink_from_bucket(seg, area, offset, size);
                return Ok(split_and_use(seg, area, offset, size, wanted));
            }
        }

        // Step 3: the designated victim.
        let dv_offset = area.dv_offset.load(Ordering::SeqCst);
        let dv_size = area.dv_size.load(Ordering::SeqCst) as usize;
        if dv_offset != 0 {
            if dv_size == wanted {
                write_header(seg.base(), dv_offset as usize, wanted, TAG_USED);
                area.dv_offset.store(0, Ordering::SeqCst);
                area.dv_size.store(0, Ordering::SeqCst);
                return Ok(dv_offset as usize);
            } else if dv_size > wanted {
                let offset = dv_offset as usize;
                write_header(seg.base(), offset, wanted, TAG_USED);
                let new_dv_offset = offset + wanted;
                let new_dv_size = dv_size - wanted;
                write_header(seg.base(), new_dv_offset, new_dv_size, TAG_SPECIAL);
                area.dv_offset.store(new_dv_offset as i64, Ordering::SeqCst);
                area.dv_size.store(new_dv_size as i64, Ordering::SeqCst);
                return Ok(offset);
            }
        }

        // Step 4: higher exact buckets, then variable buckets.
        for idx in (base_idx + 4)..EXACT_BUCKETS {
            let head = area.exact[idx].load(Ordering::SeqCst);
            if head == 0 {
                continue;
            }
            let size = idx * WORD_SIZE;
            if size == wanted {
                unlink_from_bucket(seg, area, head as usize, size);
                write_header(seg.base(), head as usize, size, TAG_USED);
                mark_prev_used(seg.base(), head as usize + size);
                return Ok(head as usize);
            }
            if size >= wanted + MIN_OBJECT_SIZE {
                unlink_from_bucket(seg, area, head as usize, size);
                return Ok(split_and_use(seg, area, head as usize, size, wanted));
            }
        }
        for var_idx in 0..VAR_BUCKETS {
            let head = area.var[var_idx].load(Ordering::SeqCst);
            if head == 0 {
                continue;
            }
            if let Some((offset, size, exact)) = find_in_bucket(seg, head, wanted) {
                unlink_from_bucket(seg, area, offset, size);
                if exact {
                    write_header(seg.base(), offset, size, TAG_USED);
                    mark_prev_used(seg.base(), offset + size);
                    return Ok(offset);
                }
                return Ok(split_and_use(seg, area, offset, size, wanted));
            }
        }

        // Step 5: grow the area by one sub-area and retry once.
        grow(seg, area, wanted)?;
        alloc_after_growth(seg, area, wanted)
    }
}

/// Re-runs just the DV/bucket checks after `grow` has installed a fresh
/// DV, so a failure here is a genuine exhaustion rather than infinite
/// recursion into another `grow`.
unsafe fn alloc_after_growth(seg: &Segment, area: &VarAreaHeader, wanted: usize) -> Result<usize> {
    let dv_offset = area.dv_offset.load(Ordering::SeqCst);
    let dv_size = area.dv_size.load(Ordering::SeqCst) as usize;
    if dv_offset != 0 && dv_size >= wanted {
        if dv_size == wanted {
            write_header(seg.base(), dv_offset as usize, wanted, TAG_USED);
            area.dv_offset.store(0, Ordering::SeqCst);
            area.dv_size.store(0, Ordering::SeqCst);
            return Ok(dv_offset as usize);
        }
        let offset = dv_offset as usize;
        write_header(seg.base(), offset, wanted, TAG_USED);
        let new_dv_offset = offset + wanted;
        let new_dv_size = dv_size - wanted;
        write_header(seg.base(), new_dv_offset, new_dv_size, TAG_SPECIAL);
        area.dv_offset.store(new_dv_offset as i64, Ordering::SeqCst);
        area.dv_size.store(new_dv_size as i64, Ordering::SeqCst);
        return Ok(offset);
    }
    Err(DbError::new(
        Status::OutOfMemory,
        Some("variable-length area exhausted after growth"),
    ))
}

/// Carves a new sub-area, bookends it with minimum-size sentinels, and
/// installs its interior as the area's new DV, demoting the old DV (if
/// any) to its proper freelist bucket first.
unsafe fn grow(seg: &Segment, area: &VarAreaHeader, minbytes: usize) -> Result<()> {
    let count = area.subarea_count.load(Ordering::SeqCst) as usize;
    if count >= MAX_SUBAREAS {
        return Err(DbError::new(
            Status::OutOfMemory,
            Some("variable-length area has exhausted its 64 sub-area slots"),
        ));
    }
    let needed = minbytes + 2 * MIN_OBJECT_SIZE;
    let (offset, size) = subarea::carve_growing(seg, count, needed)
        .ok_or_else(|| DbError::new(Status::OutOfMemory, Some("segment has no room to grow area")))?;

    area.subareas[count].offset.store(offset as i64, Ordering::SeqCst);
    area.subareas[count].size.store(size as i64, Ordering::SeqCst);
    area.subarea_count.store((count + 1) as i64, Ordering::SeqCst);

    write_header(seg.base(), offset, MIN_OBJECT_SIZE, TAG_SPECIAL);
    let interior_offset = offset + MIN_OBJECT_SIZE;
    let interior_size = size - 2 * MIN_OBJECT_SIZE;
    let end_sentinel_offset = offset + size - MIN_OBJECT_SIZE;
    write_header(seg.base(), end_sentinel_offset, MIN_OBJECT_SIZE, TAG_SPECIAL);

    let old_dv_offset = area.dv_offset.load(Ordering::SeqCst);
    let old_dv_size = area.dv_size.load(Ordering::SeqCst);
    if old_dv_offset != 0 {
        push_to_bucket(seg, area, old_dv_offset as usize, old_dv_size as usize);
        mark_prev_free(seg.base(), old_dv_offset as usize + old_dv_size as usize);
    }

    write_header(seg.base(), interior_offset, interior_size, TAG_SPECIAL);
    area.dv_offset.store(interior_offset as i64, Ordering::SeqCst);
    area.dv_size.store(interior_size as i64, Ordering::SeqCst);
    Ok(())
}

/// Frees `offset`, coalescing with free neighbours and the DV per the
/// five-step algorithm of §4.E.
pub fn free(seg: &Segment, area: &VarAreaHeader, offset: usize) -> Result<()> {
    trace!("varlen::free: offset={}", offset);
    unsafe {
        let header = read_header(seg.base(), offset);
        let tag = tag_of_header(header);
        if tag == TAG_FREE {
            return Err(DbError::new(Status::BadArgument, Some("double free")));
        }
        if tag == TAG_SPECIAL {
            return Err(DbError::new(
                Status::BadArgument,
                Some("cannot free a special (DV or sentinel) object"),
            ));
        }

        let mut cur_offset = offset;
        let mut cur_size = size_of_header(header);
        let merged_via_prev = tag == crate::mem::objhdr::TAG_USED_PREV_FREE;

        // Step 2: absorb a free left neighbour.
        if merged_via_prev {
            let boundary = read_header(seg.base(), cur_offset - WORD_SIZE);
            let prev_size = size_of_header(boundary);
            let prev_offset = cur_offset - prev_size;
            unlink_from_bucket(seg, area, prev_offset, prev_size);
            cur_offset = prev_offset;
            cur_size += prev_size;
        } else {
            // Step 3: only reachable when the left neighbour wasn't free;
            // if the freed object directly precedes the DV, merge and
            // return immediately.
            let dv_offset = area.dv_offset.load(Ordering::SeqCst);
            if dv_offset != 0 && (cur_offset + cur_size) as i64 == dv_offset {
                let dv_size = area.dv_size.load(Ordering::SeqCst);
                let new_size = dv_size + cur_size as i64;
                write_header(seg.base(), cur_offset, new_size as usize, TAG_SPECIAL);
                area.dv_offset.store(cur_offset as i64, Ordering::SeqCst);
                area.dv_size.store(new_size, Ordering::SeqCst);
                return Ok(());
            }
        }

        // Step 4: inspect the right neighbour.
        let next_offset = cur_offset + cur_size;
        let next_header = read_header(seg.base(), next_offset);
        let next_tag = tag_of_header(next_header);
        let dv_offset = area.dv_offset.load(Ordering::SeqCst);
        if next_tag == TAG_FREE {
            let next_size = size_of_header(next_header);
            unlink_from_bucket(seg, area, next_offset, next_size);
            cur_size += next_size;
        } else if dv_offset != 0 && next_offset as i64 == dv_offset {
            let dv_size = area.dv_size.load(Ordering::SeqCst);
            let new_size = dv_size + cur_size as i64;
            write_header(seg.base(), cur_offset, new_size as usize, TAG_SPECIAL);
            area.dv_offset.store(cur_offset as i64, Ordering::SeqCst);
            area.dv_size.store(new_size, Ordering::SeqCst);
            return Ok(());
        } else if next_tag == TAG_USED {
            mark_prev_free(seg.base(), next_offset);
        }
        // next_tag == TAG_SPECIAL and offset != dv_offset: a sub-area end
        // sentinel; nothing to update.

        // Step 5: promote to DV, or push the merged object to its bucket.
        let dv_offset = area.dv_offset.load(Ordering::SeqCst);
        let dv_size = area.dv_size.load(Ordering::SeqCst);
        if dv_offset == 0 || cur_size as i64 > dv_size {
            if dv_offset != 0 {
                push_to_bucket(seg, area, dv_offset as usize, dv_size as usize);
                mark_prev_free(seg.base(), dv_offset as usize + dv_size as usize);
            }
            write_header(seg.base(), cur_offset, cur_size, TAG_SPECIAL);
            mark_prev_used(seg.base(), cur_offset + cur_size);
            area.dv_offset.store(cur_offset as i64, Ordering::SeqCst);
            area.dv_size.store(cur_size as i64, Ordering::SeqCst);
        } else {
            push_to_bucket(seg, area, cur_offset, cur_size);
        }
        Ok(())
    }
}

/// Read-only header inspection used by record traversal (§4.G
/// `get_first`/`get_next`) to skip free objects, the DV, and sentinels.
pub fn header_at(seg: &Segment, offset: usize) -> (usize, i64) {
    let h = unsafe { read_header(seg.base(), offset) };
    (size_of_header(h), tag_of_header(h))
}

pub fn make_size_tag(size: usize, tag: i64) -> i64 {
    make_header(size, tag)
}
