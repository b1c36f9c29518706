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

//! Whole-segment dump format (§4.J): a raw byte copy of the segment's
//! used prefix `[0, free_offset)`, with the checksum header field
//! overwritten by the CRC32 of that same prefix computed with the field
//! zeroed. `dump` takes the read lock for the copy; `import` requires an
//! already-sized segment and resets lock state afterward, since lock
//! ownership is process-local and never survives a snapshot.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::Ordering;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::{DbError, Result, Status};
use crate::features::Features;
use crate::lock;
use crate::mem::segment::{Segment, SegmentHeader, HEADER_SIZE, MAGIC_MARK, VERSION_MAJOR};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Header facts a caller needs before attempting [`import`]: the minimum
/// segment size that can hold the dump, and the size the source segment
/// had declared for itself.
#[derive(Debug, Clone, Copy)]
pub struct DumpInfo {
    pub minsize: usize,
    pub maxsize: usize,
}

/// Byte offset of field `f` inside [`SegmentHeader`], computed from a
/// zeroed, never-dereferenced instance. `repr(C)` fixes the layout
/// regardless of which segment size produced the bytes being inspected,
/// so this holds for both a live `Segment` and a dump file read off disk.
fn field_offset<T>(f: impl FnOnce(&SegmentHeader) -> &T) -> usize {
    let uninit = std::mem::MaybeUninit::<SegmentHeader>::zeroed();
    let base = uninit.as_ptr() as usize;
    let field = f(unsafe { &*uninit.as_ptr() }) as *const T as usize;
    field - base
}

fn corrupt(msg: &str) -> DbError {
    DbError::new(Status::Corruption, Some(msg))
}

fn io_err(e: std::io::Error) -> DbError {
    DbError::new(Status::SystemError, Some(&e.to_string()))
}

/// Dumps `seg`'s used prefix to `path` under the read lock (§4.J `dump`).
pub fn dump(seg: &Segment, path: &Path) -> Result<()> {
    let held = lock::start_read(seg)?;
    let dbsize = seg.header().free_offset.load(Ordering::SeqCst) as usize;
    let mut buf = seg.bytes()[..dbsize].to_vec();
    lock::end_read(seg, held);

    let checksum_off = field_offset(|h| &h.checksum);
    buf[checksum_off..checksum_off + 4].copy_from_slice(&0u32.to_le_bytes());
    let crc = CRC32.checksum(&buf);
    buf[checksum_off..checksum_off + 4].copy_from_slice(&crc.to_le_bytes());

    let mut file = File::create(path).map_err(io_err)?;
    file.write_all(&buf).map_err(io_err)?;
    file.flush().map_err(io_err)?;
    Ok(())
}

/// Validates a dump file's header and CRC32 without touching any segment
/// (§4.J `check_dump`).
pub fn check_dump(path: &Path) -> Result<DumpInfo> {
    let mut buf = Vec::new();
    File::open(path)
        .map_err(io_err)?
        .read_to_end(&mut buf)
        .map_err(io_err)?;
    if buf.len() < HEADER_SIZE {
        return Err(corrupt("dump file shorter than a segment header"));
    }

    let magic_off = field_offset(|h| &h.magic);
    let magic = u32::from_le_bytes(buf[magic_off..magic_off + 4].try_into().unwrap());
    if magic != MAGIC_MARK {
        if magic.swap_bytes() == MAGIC_MARK {
            return Err(corrupt("dump file byte order differs from this build"));
        }
        return Err(corrupt("incompatible dump file (bad magic)"));
    }

    let version_off = field_offset(|h| &h.version_major);
    let version_major = u16::from_le_bytes(buf[version_off..version_off + 2].try_into().unwrap());
    if version_major != VERSION_MAJOR {
        return Err(corrupt("incompatible dump file (version mismatch)"));
    }

    let features_off = field_offset(|h| &h.features);
    let features = u32::from_le_bytes(buf[features_off..features_off + 4].try_into().unwrap());
    if features != Features::default().bits() {
        return Err(corrupt("incompatible dump file (feature bitmask mismatch)"));
    }

    let free_off = field_offset(|h| &h.free_offset);
    let minsize = i64::from_le_bytes(buf[free_off..free_off + 8].try_into().unwrap()) as usize;

    let total_off = field_offset(|h| &h.total_size);
    let maxsize = i64::from_le_bytes(buf[total_off..total_off + 8].try_into().unwrap()) as usize;

    let extdb_off = field_offset(|h| &h.extdb_count);
    let extdb_count = i64::from_le_bytes(buf[extdb_off..extdb_off + 8].try_into().unwrap());
    if extdb_count != 0 {
        return Err(corrupt("dump contains external database references"));
    }

    if buf.len() != minsize {
        return Err(corrupt("dump file size does not match its recorded used prefix"));
    }

    let checksum_off = field_offset(|h| &h.checksum);
    let dump_crc = u32::from_le_bytes(buf[checksum_off..checksum_off + 4].try_into().unwrap());
    buf[checksum_off..checksum_off + 4].copy_from_slice(&0u32.to_le_bytes());
    let crc = CRC32.checksum(&buf);
    if crc != dump_crc {
        return Err(corrupt("dump file CRC32 mismatch"));
    }

    Ok(DumpInfo { minsize, maxsize })
}

/// Restores `seg` from a dump file (§4.J `import`). The caller is
/// expected to have run [`check_dump`] already; this only re-validates
/// the two facts that would otherwise corrupt `seg` outright (it fits,
/// and it carries no external references) before copying bytes in.
pub fn import(seg: &Segment, path: &Path) -> Result<()> {
    let mut buf = Vec::new();
    File::open(path)
        .map_err(io_err)?
        .read_to_end(&mut buf)
        .map_err(io_err)?;
    if buf.len() < HEADER_SIZE {
        return Err(corrupt("dump file shorter than a segment header"));
    }

    let extdb_off = field_offset(|h| &h.extdb_count);
    let extdb_count = i64::from_le_bytes(buf[extdb_off..extdb_off + 8].try_into().unwrap());
    if extdb_count != 0 {
        return Err(corrupt("dump contains external database references"));
    }

    let free_off = field_offset(|h| &h.free_offset);
    let dbsize = i64::from_le_bytes(buf[free_off..free_off + 8].try_into().unwrap()) as usize;
    if seg.size() < dbsize {
        return Err(corrupt("data does not fit in the target segment"));
    }

    seg.bytes_mut()[..dbsize].copy_from_slice(&buf[..dbsize]);
    seg.header().checksum.store(0, Ordering::SeqCst);
    lock::reset(seg);
    Ok(())
}

#[cfg(test)]
mod test_dump {
    use super::*;
    use crate::record;
    use crate::index::NullIndex;
    use tempfile::NamedTempFile;

    #[test]
    fn test_check_dump_succeeds_for_fresh_segment() {
        let seg = Segment::attach_local(256 * 1024).unwrap();
        let tmp = NamedTempFile::new().unwrap();
        dump(&seg, tmp.path()).unwrap();
        let info = check_dump(tmp.path()).unwrap();
        assert_eq!(info.maxsize, seg.size());
        assert_eq!(info.minsize, seg.header().free_offset.load(Ordering::SeqCst) as usize);
    }

    #[test]
    fn test_import_restores_records() {
        let seg = Segment::attach_local(256 * 1024).unwrap();
        let rec = record::create(&seg, &NullIndex, 1).unwrap();
        let w = crate::encoding::encode_small_int(99).unwrap();
        record::set_field(&seg, rec, 0, w, &NullIndex).unwrap();

        let tmp = NamedTempFile::new().unwrap();
        dump(&seg, tmp.path()).unwrap();
        check_dump(tmp.path()).unwrap();

        let target = Segment::attach_local(256 * 1024).unwrap();
        import(&target, tmp.path()).unwrap();

        let restored = record::get_first(&target).unwrap();
        assert_eq!(record::get_field(&target, restored, 0).unwrap(), w);
    }

    #[test]
    fn test_corrupted_crc_rejected() {
        let seg = Segment::attach_local(256 * 1024).unwrap();
        let tmp = NamedTempFile::new().unwrap();
        dump(&seg, tmp.path()).unwrap();

        let mut bytes = std::fs::read(tmp.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(tmp.path(), &bytes).unwrap();

        let err = check_dump(tmp.path()).unwrap_err();
        assert_eq!(err.status(), Status::Corruption);
    }

    #[test]
    fn test_import_resets_lock_state() {
        let seg = Segment::attach_local(256 * 1024).unwrap();
        let held = lock::start_write(&seg).unwrap();
        lock::end_write(&seg, held);

        let tmp = NamedTempFile::new().unwrap();
        dump(&seg, tmp.path()).unwrap();

        let target = Segment::attach_local(256 * 1024).unwrap();
        let h2 = lock::start_write(&target).unwrap();
        // leave the target's lock state non-zero before import
        lock::end_write(&target, h2);
        import(&target, tmp.path()).unwrap();
        assert_eq!(target.header().locks.word0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_import_rejects_oversized_dump() {
        let seg = Segment::attach_local(256 * 1024).unwrap();
        let tmp = NamedTempFile::new().unwrap();
        dump(&seg, tmp.path()).unwrap();

        let target = Segment::attach_local(HEADER_SIZE + 64 * 1024).unwrap();
        // the dump's free_offset reflects the larger source segment's
        // header-table carve, which may not fit a much smaller target.
        let result = import(&target, tmp.path());
        if target.size() < seg.header().free_offset.load(Ordering::SeqCst) as usize {
            assert!(result.is_err());
        }
    }
}
