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

//! Writer-preference spinlock (§4.H WP). Same reader/writer word as
//! [`crate::lock::rp`], plus a waiters counter: a reader must see zero
//! waiting writers before it is allowed to add itself to the active
//! count, so a steady stream of writers can starve readers.

use std::sync::atomic::Ordering;

use crossbeam_utils::Backoff;

use crate::error::{DbError, Result, Status};
use crate::mem::segment::LockHeader;

const WRITER_BIT: i64 = 1;
const READER_STEP: i64 = 2;

pub const MAX_SPINS: u32 = 2_000_000;

fn warn_if_near_bound(spins: u32, who: &str) {
    if spins == MAX_SPINS * 9 / 10 {
        warn!("{}: spin count {} is within 10% of its bound ({})", who, spins, MAX_SPINS);
    }
}

pub fn start_read(lock: &LockHeader) -> Result<()> {
    let backoff = Backoff::new();
    let mut spins = 0;
    loop {
        while lock.word1.load(Ordering::SeqCst) != 0 {
            spins += 1;
            if spins > MAX_SPINS {
                return Err(timeout());
            }
            warn_if_near_bound(spins, "wp::start_read");
            backoff.snooze();
        }
        lock.word0.fetch_add(READER_STEP, Ordering::SeqCst);
        if lock.word0.load(Ordering::SeqCst) & WRITER_BIT == 0 {
            return Ok(());
        }
        // a writer slipped in between the waiters check and our
        // increment; back off and retry from the waiters check.
        lock.word0.fetch_sub(READER_STEP, Ordering::SeqCst);
        spins += 1;
        if spins > MAX_SPINS {
            return Err(timeout());
        }
        warn_if_near_bound(spins, "wp::start_read");
        backoff.snooze();
    }
}

pub fn end_read(lock: &LockHeader) {
    lock.word0.fetch_sub(READER_STEP, Ordering::SeqCst);
}

pub fn start_write(lock: &LockHeader) -> Result<()> {
    lock.word1.fetch_add(1, Ordering::SeqCst);
    let backoff = Backoff::new();
    let mut spins = 0;
    loop {
        if lock
            .word0
            .compare_exchange(0, WRITER_BIT, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Ok(());
        }
        spins += 1;
        if spins > MAX_SPINS {
            lock.word1.fetch_sub(1, Ordering::SeqCst);
            return Err(timeout());
        }
        warn_if_near_bound(spins, "wp::start_write");
        backoff.snooze();
    }
}

pub fn end_write(lock: &LockHeader) {
    lock.word0.fetch_and(!WRITER_BIT, Ordering::SeqCst);
    lock.word1.fetch_sub(1, Ordering::SeqCst);
}

fn timeout() -> DbError {
    DbError::new(Status::LockTimeout, Some("writer-preference spinlock spun past its bound"))
}

#[cfg(test)]
mod test_wp {
    use super::*;
    use crate::mem::segment::Segment;
    use std::sync::Arc;
    use std::thread;

    fn fresh_lock() -> Segment {
        Segment::attach_local(128 * 1024).unwrap()
    }

    #[test]
    fn test_write_then_write_is_exclusive() {
        let seg = fresh_lock();
        let lock = &seg.header().locks;
        start_write(lock).unwrap();
        assert_eq!(lock.word0.load(Ordering::SeqCst) & WRITER_BIT, WRITER_BIT);
        end_write(lock);
        assert_eq!(lock.word0.load(Ordering::SeqCst), 0);
        assert_eq!(lock.word1.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_read_then_read_concurrent() {
        let seg = fresh_lock();
        let lock = &seg.header().locks;
        start_read(lock).unwrap();
        start_read(lock).unwrap();
        assert_eq!(lock.word0.load(Ordering::SeqCst), 2 * READER_STEP);
        end_read(lock);
        end_read(lock);
        assert_eq!(lock.word0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_n_threads_k_increments_is_exact() {
        let seg = Arc::new(fresh_lock());
        let counter_offset = seg.size() - 8;
        let n = 6;
        let k = 200;
        let mut handles = vec![];
        for _ in 0..n {
            let seg = Arc::clone(&seg);
            handles.push(thread::spawn(move || {
                for _ in 0..k {
                    let lock = &seg.header().locks;
                    start_write(lock).unwrap();
                    unsafe {
                        let v = crate::mem::atomic::load(seg.base(), counter_offset);
                        crate::mem::atomic::store(seg.base(), counter_offset, v + 1);
                    }
                    end_write(lock);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let total = unsafe { crate::mem::atomic::load(seg.base(), counter_offset) };
        assert_eq!(total, (n * k) as i64);
    }
}
