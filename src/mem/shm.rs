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

//! OS-level named shared memory, backed by System V `shmget`/`shmat` on
//! unix. This is the only module that talks to the kernel directly; the
//! rest of the engine only ever sees a `Segment`'s base pointer and size.

use crate::error::{DbError, Result, Status};

/// A System V shared memory segment attached into this process's address
/// space.
pub struct ShmSegment {
    id: libc::c_int,
    base: *mut u8,
    size: usize,
    owns: bool,
}

unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Looks up an existing segment registered under `key` and attaches
    /// it without creating anything.
    pub fn open_existing(key: i64) -> Result<ShmSegment> {
        let shm_key = key as libc::key_t;
        let id = unsafe { libc::shmget(shm_key, 0, 0) };
        if id < 0 {
            return Err(shm_error("shmget (lookup)"));
        }
        let size = shm_size(id)?;
        let base = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if base as isize == -1 {
            return Err(shm_error("shmat"));
        }
        Ok(ShmSegment {
            id,
            base: base as *mut u8,
            size,
            owns: false,
        })
    }

    /// Creates a new segment of `max` bytes, falling back to `min` if the
    /// OS refuses the larger request (§4.B).
    pub fn create(key: i64, max: usize, min: usize, mode: u32) -> Result<(ShmSegment, usize)> {
        let shm_key = key as libc::key_t;
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | (mode as libc::c_int);
        let mut attempt_size = max;
        loop {
            let id = unsafe { libc::shmget(shm_key, attempt_size, flags) };
            if id >= 0 {
                let base = unsafe { libc::shmat(id, std::ptr::null(), 0) };
                if base as isize == -1 {
                    return Err(shm_error("shmat"));
                }
                return Ok((
                    ShmSegment {
                        id,
                        base: base as *mut u8,
                        size: attempt_size,
                        owns: true,
                    },
                    attempt_size,
                ));
            }
            if attempt_size <= min {
                return Err(shm_error("shmget"));
            }
            attempt_size = min;
        }
    }

    /// Destroys the segment registered under `key` at the OS level.
    pub fn destroy(key: i64) -> Result<()> {
        let shm_key = key as libc::key_t;
        let id = unsafe { libc::shmget(shm_key, 0, 0) };
        if id < 0 {
            // Already gone: deletion of a nonexistent segment is not an
            // error (§4.B `delete`).
            return Ok(());
        }
        let rc = unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(shm_error("shmctl(IPC_RMID)"));
        }
        Ok(())
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.base as *const libc::c_void);
        }
        // `owns` does not trigger IPC_RMID here: detach never destroys
        // the segment (§4.B `detach`), only `delete_named` does.
        let _ = self.owns;
    }
}

fn shm_size(id: libc::c_int) -> Result<usize> {
    unsafe {
        let mut ds: libc::shmid_ds = std::mem::zeroed();
        let rc = libc::shmctl(id, libc::IPC_STAT, &mut ds);
        if rc < 0 {
            return Err(shm_error("shmctl(IPC_STAT)"));
        }
        Ok(ds.shm_segsz as usize)
    }
}

fn shm_error(op: &str) -> DbError {
    let errno = std::io::Error::last_os_error();
    DbError::new(
        Status::SystemError,
        Some(&format!("{} failed: {}", op, errno)),
    )
}

#[cfg(test)]
mod test_shm {
    use super::*;

    #[test]
    fn test_create_and_destroy_roundtrip() {
        let key = 424_242 + (std::process::id() as i64 % 1000);
        let _ = ShmSegment::destroy(key);
        let (seg, size) = ShmSegment::create(key, 64 * 1024, 16 * 1024, 0o600).unwrap();
        assert_eq!(size, 64 * 1024);
        assert_eq!(seg.size(), 64 * 1024);
        drop(seg);
        ShmSegment::destroy(key).unwrap();
    }

    #[test]
    fn test_open_missing_fails() {
        let key = 999_999;
        let _ = ShmSegment::destroy(key);
        let err = ShmSegment::open_existing(key).unwrap_err();
        assert_eq!(err.status(), Status::SystemError);
    }
}
