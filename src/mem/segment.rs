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

//! Segment header layout and the attach/detach/delete lifecycle (§3,
//! §4.B).
//!
//! # Segment Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ SegmentHeader (fixed size, see below)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │ sub-area 1 (data area)                                    │
//! ├──────────────────────────────────────────────────────────┤
//! │ sub-area 2 (long strings)                                 │
//! ├──────────────────────────────────────────────────────────┤
//! │ ...                                                       │
//! ├──────────────────────────────────────────────────────────┤
//! │ unused space, claimed by future sub-areas as areas grow    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Offset 0 is always the header. Every pointer stored anywhere in the
//! segment — freelist links, backlink chains, encoded record references —
//! is a byte offset from this base, never a native pointer, so the same
//! bytes are meaningful to every process that attaches, regardless of
//! where the segment happens to be mapped in that process's address
//! space.

use std::sync::atomic::{AtomicI64, AtomicU32};

use crate::error::{DbError, Result, Status};
use crate::features::Features;

/// `INIT`: header has been written but `init_db_memsegment` has not yet
/// completed. A crash between these two states is how the source project
/// (and invariant 8 of the data model) says an attacher can tell a
/// half-built segment from a usable one.
pub const MAGIC_INIT: u32 = u32::from_le_bytes(*b"INIT");
/// `MARK`: the segment has been fully initialized, forever after.
pub const MAGIC_MARK: u32 = u32::from_le_bytes(*b"MARK");

pub const VERSION_MAJOR: u16 = 0;
pub const VERSION_MINOR: u16 = 9;
pub const VERSION_PATCH: u16 = 0;

/// Up to 64 sub-areas per area (§3 "Area").
pub const MAX_SUBAREAS: usize = 64;
/// Exact-size freelist buckets, one per 8-byte size class below 2048
/// bytes (§4.E).
pub const EXACT_BUCKETS: usize = 256;
/// Power-of-two range buckets above the exact range.
pub const VAR_BUCKETS: usize = 32;

/// Default initial sub-area size: 8 KiB.
pub const DEFAULT_SUBAREA_SIZE: usize = 8 * 1024;
/// Alignment all allocator arithmetic respects.
pub const ALIGNMENT: usize = 8;

/// One carved chunk of the segment owned by an area.
#[repr(C)]
pub struct SubArea {
    pub offset: AtomicI64,
    pub size: AtomicI64,
}

impl SubArea {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.offset.load(std::sync::atomic::Ordering::SeqCst) == 0
    }
}

/// Header for a fixed-length area: one freelist head plus the sub-areas
/// backing it (§3 "Fixed-length area", §4.D).
#[repr(C)]
pub struct FixedAreaHeader {
    pub freelist: AtomicI64,
    pub cell_size: AtomicI64,
    pub subarea_count: AtomicI64,
    pub subareas: [SubArea; MAX_SUBAREAS],
}

/// Header for a variable-length area: bucketed freelists, the designated
/// victim cache, and the sub-areas backing it (§3 "Variable-length
/// area", §4.E).
#[repr(C)]
pub struct VarAreaHeader {
    pub subarea_count: AtomicI64,
    pub subareas: [SubArea; MAX_SUBAREAS],
    pub dv_offset: AtomicI64,
    pub dv_size: AtomicI64,
    pub exact: [AtomicI64; EXACT_BUCKETS],
    pub var: [AtomicI64; VAR_BUCKETS],
}

/// Enough words to back whichever of the three lock protocols (§4.H) the
/// segment was built with. The C original unions these; a flat struct of
/// generically-named words is the idiomatic equivalent, since which
/// fields are meaningful is determined entirely by `lock_protocol`.
#[repr(C)]
pub struct LockHeader {
    /// RP/WP: packed writer-bit + reader-count word. TFQ: offset of the
    /// queue tail node (0 if the queue is empty).
    pub word0: AtomicI64,
    /// WP: writers-waiting counter. TFQ: offset of the queue head node.
    pub word1: AtomicI64,
    /// TFQ: head of the stack-freelist of queue nodes.
    pub word2: AtomicI64,
}

/// The segment header: offset 0 of every segment (§3 "Segment header").
#[repr(C)]
pub struct SegmentHeader {
    pub magic: AtomicU32,
    pub version_major: u16,
    pub version_minor: u16,
    pub version_patch: u16,
    pub _pad0: u16,
    pub features: AtomicU32,
    pub checksum: AtomicU32,
    pub total_size: AtomicI64,
    /// The bump pointer: offset of the first unclaimed byte (§4.C).
    pub free_offset: AtomicI64,
    /// Informational only: the address this segment was mapped at by the
    /// process that created it. Never dereferenced.
    pub origin_addr: AtomicI64,
    pub shmem_key: AtomicI64,

    pub data_area: VarAreaHeader,
    pub longstr_area: VarAreaHeader,
    pub indexhash_area: VarAreaHeader,

    pub listcell_area: FixedAreaHeader,
    pub shortstr_area: FixedAreaHeader,
    pub word_area: FixedAreaHeader,
    pub doubleword_area: FixedAreaHeader,
    pub ttree_area: FixedAreaHeader,
    pub indexhdr_area: FixedAreaHeader,

    pub strhash_table: AtomicI64,
    pub strhash_size: AtomicI64,
    pub indexhash_table: AtomicI64,
    pub indexhash_size: AtomicI64,

    pub extdb_table: AtomicI64,
    pub extdb_count: AtomicI64,

    pub log_enabled: AtomicI64,

    pub lock_protocol: AtomicU32,
    pub _pad1: u32,
    pub locks: LockHeader,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();

/// Owning handle to the bytes backing a segment. `Local` is a
/// process-private buffer (`attach_local`); `Shared` is memory obtained
/// from the OS and named so other processes can find it (`attach`).
enum Backing {
    Local(Vec<u8>),
    Shared(crate::mem::shm::ShmSegment),
}

/// A live attachment to a segment: either a process-local buffer or a
/// mapping of a named OS shared-memory region. Every built-in area, the
/// lock words, and the journal-enabled flag live inside the bytes this
/// handle owns; nothing here is meaningful without it.
pub struct Segment {
    backing: Backing,
    base: *mut u8,
    size: usize,
}

// SAFETY: the segment is explicitly designed to be shared across threads
// and processes; all access to its interior goes through the atomic
// primitives in `mem::atomic` or through operations bracketed by the
// database-wide lock.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.size) }
    }

    #[inline]
    pub fn bytes_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base, self.size) }
    }

    /// Attaches to a process-local buffer of `size` bytes and initializes
    /// it as a fresh segment (`attach_local`, §4.B).
    pub fn attach_local(size: usize) -> Result<Segment> {
        if size < HEADER_SIZE {
            return Err(DbError::new(
                Status::BadArgument,
                Some("segment size smaller than header"),
            ));
        }
        let mut buf = vec![0u8; size];
        let base = buf.as_mut_ptr();
        let mut seg = Segment {
            backing: Backing::Local(buf),
            base,
            size,
        };
        init_memsegment(&mut seg, Features::default(), 0)?;
        Ok(seg)
    }

    /// Creates or attaches a named OS shared-memory segment (`attach`,
    /// §4.B). Tries `max` bytes first, falling back to `min` on failure;
    /// if the segment already exists, validates its header instead of
    /// creating.
    pub fn attach(
        key: i64,
        min: usize,
        max: usize,
        create: bool,
        mode: u32,
    ) -> Result<Segment> {
        match crate::mem::shm::ShmSegment::open_existing(key) {
            Ok(shm) => {
                let base = shm.base();
                let size = shm.size();
                let seg = Segment {
                    backing: Backing::Shared(shm),
                    base,
                    size,
                };
                validate_existing(&seg, min)?;
                Ok(seg)
            }
            Err(_) if create => {
                let (shm, actual_size) =
                    crate::mem::shm::ShmSegment::create(key, max, min, normalize_mode(mode))?;
                let base = shm.base();
                let mut seg = Segment {
                    backing: Backing::Shared(shm),
                    base,
                    size: actual_size,
                };
                seg.header().shmem_key.store(key, std::sync::atomic::Ordering::SeqCst);
                init_memsegment(&mut seg, Features::default(), key)?;
                Ok(seg)
            }
            Err(e) => Err(e),
        }
    }

    /// Unmaps the segment in this process without destroying it
    /// (`detach`, §4.B). Any process-local caches of offsets held outside
    /// this handle must be considered invalid after this call returns
    /// (§5 "Global state").
    pub fn detach(self) {
        // Dropping `self` unmaps (Shared) or frees (Local) the backing
        // storage; named segments persist at the OS level until
        // `delete_named` is called.
    }

    /// Destroys the OS-level shared segment registered under `key`
    /// (`delete`, §4.B). A no-op, returning success, if no such segment
    /// exists.
    pub fn delete_named(key: i64) -> Result<()> {
        crate::mem::shm::ShmSegment::destroy(key)
    }
}

/// Normalizes an attach key: non-positive or extremal values fall back to
/// a fixed default, matching the "Attach key" rule of §6.
pub fn normalize_key(raw: i64) -> i64 {
    const DEFAULT_KEY: i64 = 1000;
    if raw <= 0 || raw == i64::MAX || raw == i64::MIN {
        DEFAULT_KEY
    } else {
        raw
    }
}

/// Normalizes a creation mode mask (§6 "Permissions"): owner always gets
/// read/write; group and other bits are forced all-or-nothing together
/// so a segment is either private to its group or fully world-shared,
/// never partially so.
pub fn normalize_mode(mode: u32) -> u32 {
    let owner_rw = 0o600;
    let group_other = mode & 0o077;
    let shared = if group_other != 0 { 0o077 } else { 0 };
    owner_rw | shared
}

fn validate_existing(seg: &Segment, min: usize) -> Result<()> {
    use std::sync::atomic::Ordering;
    let h = seg.header();
    let magic = h.magic.load(Ordering::SeqCst);
    if magic != MAGIC_MARK {
        return Err(DbError::new(
            Status::Corruption,
            Some("segment magic is not MARK (mid-construction or foreign memory)"),
        ));
    }
    if h.version_major != VERSION_MAJOR {
        return Err(DbError::new(
            Status::Corruption,
            Some("segment version does not match this build"),
        ));
    }
    let expected = Features::default().bits();
    if h.features.load(Ordering::SeqCst) != expected {
        return Err(DbError::new(
            Status::Corruption,
            Some("segment feature bitmask does not match this build"),
        ));
    }
    let total = h.total_size.load(Ordering::SeqCst) as usize;
    if min > 0 && total < min {
        return Err(DbError::new(
            Status::Corruption,
            Some("existing segment is smaller than the requested minimum"),
        ));
    }
    Ok(())
}

/// Lays out and initializes every built-in area's header in a freshly
/// allocated segment, then flips the magic mark from `INIT` to `MARK`
/// (invariant 8). Mirrors the source's `init_db_memsegment`.
fn init_memsegment(seg: &mut Segment, features: Features, shmem_key: i64) -> Result<()> {
    use std::sync::atomic::Ordering;
    let h = seg.header();
    h.magic.store(MAGIC_INIT, Ordering::SeqCst);
    h.version_major = VERSION_MAJOR;
    h.version_minor = VERSION_MINOR;
    h.version_patch = VERSION_PATCH;
    h.features.store(features.bits(), Ordering::SeqCst);
    h.checksum.store(0, Ordering::SeqCst);
    h.total_size.store(seg.size as i64, Ordering::SeqCst);
    h.free_offset.store(crate::util::align8(HEADER_SIZE) as i64, Ordering::SeqCst);
    h.origin_addr.store(seg.base as i64, Ordering::SeqCst);
    h.shmem_key.store(shmem_key, Ordering::SeqCst);
    h.log_enabled.store(0, Ordering::SeqCst);
    h.extdb_table.store(0, Ordering::SeqCst);
    h.extdb_count.store(0, Ordering::SeqCst);
    h.strhash_table.store(0, Ordering::SeqCst);
    h.strhash_size.store(0, Ordering::SeqCst);
    h.indexhash_table.store(0, Ordering::SeqCst);
    h.indexhash_size.store(0, Ordering::SeqCst);
    h.lock_protocol.store(crate::lock::Protocol::default() as u32, Ordering::SeqCst);
    h.locks.word0.store(0, Ordering::SeqCst);
    h.locks.word1.store(0, Ordering::SeqCst);
    h.locks.word2.store(0, Ordering::SeqCst);

    for area in [
        &h.data_area,
        &h.longstr_area,
        &h.indexhash_area,
    ] {
        area.subarea_count.store(0, Ordering::SeqCst);
        area.dv_offset.store(0, Ordering::SeqCst);
        area.dv_size.store(0, Ordering::SeqCst);
        for b in area.exact.iter() {
            b.store(0, Ordering::SeqCst);
        }
        for b in area.var.iter() {
            b.store(0, Ordering::SeqCst);
        }
        for s in area.subareas.iter() {
            s.offset.store(0, Ordering::SeqCst);
            s.size.store(0, Ordering::SeqCst);
        }
    }

    let fixed_cell_sizes: [(&FixedAreaHeader, i64); 6] = [
        (&h.listcell_area, 16),
        (&h.shortstr_area, 32),
        (&h.word_area, 16),
        (&h.doubleword_area, 16),
        (&h.ttree_area, 48),
        (&h.indexhdr_area, 32),
    ];
    for (area, cell_size) in fixed_cell_sizes.iter() {
        area.freelist.store(0, Ordering::SeqCst);
        area.cell_size.store(*cell_size, Ordering::SeqCst);
        area.subarea_count.store(0, Ordering::SeqCst);
        for s in area.subareas.iter() {
            s.offset.store(0, Ordering::SeqCst);
            s.size.store(0, Ordering::SeqCst);
        }
    }

    // Reserve a string-hash table and an index-hash table as a fixed
    // percentage of segment size, carved immediately after the header so
    // every later sub-area allocation lands after them.
    const TABLE_PERCENT: usize = 2;
    let table_bytes = crate::util::align8((seg.size * TABLE_PERCENT / 100).max(64));
    let strhash_offset =
        crate::mem::subarea::carve(seg, table_bytes).ok_or_else(|| too_small(seg.size))?;
    h.strhash_table.store(strhash_offset as i64, Ordering::SeqCst);
    h.strhash_size.store((table_bytes / 8) as i64, Ordering::SeqCst);

    let indexhash_offset =
        crate::mem::subarea::carve(seg, table_bytes).ok_or_else(|| too_small(seg.size))?;
    h.indexhash_table.store(indexhash_offset as i64, Ordering::SeqCst);
    h.indexhash_size.store((table_bytes / 8) as i64, Ordering::SeqCst);

    for i in 0..(table_bytes / 8) {
        unsafe {
            crate::mem::atomic::store(seg.base, strhash_offset + i * 8, 0);
            crate::mem::atomic::store(seg.base, indexhash_offset + i * 8, 0);
        }
    }

    h.magic.store(MAGIC_MARK, Ordering::SeqCst);
    Ok(())
}

fn too_small(size: usize) -> DbError {
    DbError::new(
        Status::OutOfMemory,
        Some(&format!("segment of {} bytes too small to initialize", size)),
    )
}
