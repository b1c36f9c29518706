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

//! Fixed-length allocator: one singly-linked freelist per area, threaded
//! through the first word of each free cell (§4.D). Used for list cells,
//! short strings, word/doubleword cells, T-tree nodes, and index
//! headers.
//!
//! All mutating entry points here are called with the database-wide
//! write lock held by the caller (§5), so the freelist head itself needs
//! no CAS; only the segment bump pointer (shared with every other area)
//! is advanced atomically.

use std::sync::atomic::Ordering;

use crate::error::{DbError, Result, Status};
use crate::mem::atomic;
use crate::mem::segment::{FixedAreaHeader, Segment, MAX_SUBAREAS};
use crate::mem::subarea;

/// Pops the freelist head and returns its offset, growing the area by one
/// sub-area first if the list is empty.
pub fn alloc(seg: &Segment, area: &FixedAreaHeader) -> Result<usize> {
    let head = area.freelist.load(Ordering::SeqCst);
    if head != 0 {
        let next = unsafe { atomic::load(seg.base(), head as usize) };
        area.freelist.store(next, Ordering::SeqCst);
        trace!("fixed::alloc: reused freelist cell {}", head);
        return Ok(head as usize);
    }
    trace!("fixed::alloc: freelist empty, growing");
    grow(seg, area)?;
    let head = area.freelist.load(Ordering::SeqCst);
    if head == 0 {
        return Err(DbError::new(
            Status::OutOfMemory,
            Some("fixed-length area exhausted after growth"),
        ));
    }
    let next = unsafe { atomic::load(seg.base(), head as usize) };
    area.freelist.store(next, Ordering::SeqCst);
    Ok(head as usize)
}

/// Pushes `offset` back onto the area's freelist head.
pub fn free(seg: &Segment, area: &FixedAreaHeader, offset: usize) {
    trace!("fixed::free: offset={}", offset);
    let head = area.freelist.load(Ordering::SeqCst);
    unsafe { atomic::store(seg.base(), offset, head) };
    area.freelist.store(offset as i64, Ordering::SeqCst);
}

fn grow(seg: &Segment, area: &FixedAreaHeader) -> Result<()> {
    let count = area.subarea_count.load(Ordering::SeqCst) as usize;
    if count >= MAX_SUBAREAS {
        return Err(DbError::new(
            Status::OutOfMemory,
            Some("fixed-length area has exhausted its 64 sub-area slots"),
        ));
    }
    let cell_size = area.cell_size.load(Ordering::SeqCst) as usize;
    let (offset, size) = subarea::carve_growing(seg, count, cell_size)
        .ok_or_else(|| DbError::new(Status::OutOfMemory, Some("segment has no room to grow area")))?;

    area.subareas[count].offset.store(offset as i64, Ordering::SeqCst);
    area.subareas[count].size.store(size as i64, Ordering::SeqCst);
    area.subarea_count.store((count + 1) as i64, Ordering::SeqCst);

    format_into_freelist(seg, area, offset, size, cell_size);
    Ok(())
}

/// Chains every cell-sized slot of a freshly carved sub-area and prepends
/// the chain to the area's existing freelist.
fn format_into_freelist(seg: &Segment, area: &FixedAreaHeader, offset: usize, size: usize, cell_size: usize) {
    let cells = size / cell_size;
    if cells == 0 {
        return;
    }
    let old_head = area.freelist.load(Ordering::SeqCst);
    for i in 0..cells {
        let cell_off = offset + i * cell_size;
        let next = if i + 1 == cells {
            old_head
        } else {
            (offset + (i + 1) * cell_size) as i64
        };
        unsafe { atomic::store(seg.base(), cell_off, next) };
    }
    area.freelist.store(offset as i64, Ordering::SeqCst);
}
