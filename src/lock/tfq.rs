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

//! Task-fair queued lock (§4.H TFQ). An MCS-style FIFO queue of nodes
//! carved from the (otherwise unused, since T-tree indexing is an opaque
//! external collaborator) T-tree fixed-length area: each waiter CASes
//! itself onto the tail and links its predecessor's `next` to itself. A
//! node with no predecessor is the new holder immediately; a reader whose
//! predecessor is itself a reader also proceeds immediately (no blocking),
//! matching §4.H's read-cascade rule. Everyone else sleeps on a futex
//! hosted in their own node until their predecessor clears it.
//!
//! `LockHeader::word0` is the queue tail (0 if empty); `word1`/`word2` are
//! unused by this protocol — queue-node storage and freeing goes through
//! the plain [`crate::mem::fixed`] allocator rather than a second,
//! refcounted freelist (§9's open question about TFQ's node pool is
//! resolved this way: the simpler allocator is always correct here since
//! nodes are never shared).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::{DbError, Result, Status};
use crate::mem::segment::{LockHeader, Segment};
use crate::mem::{atomic, fixed};

const OFF_NEXT: usize = 0;
const OFF_WAIT: usize = 8;
const OFF_ROLE: usize = 16;

const ROLE_READER: i64 = 0;
const ROLE_WRITER: i64 = 1;
const ROLE_ABANDONED: i64 = 2;

/// A live TFQ queue membership; opaque to callers, handed back to
/// `release`.
#[derive(Debug, Clone, Copy)]
pub struct Ticket(pub usize);

fn wait_flag(seg: &Segment, node: usize) -> &AtomicU32 {
    unsafe { &*(seg.base().add(node + OFF_WAIT) as *const AtomicU32) }
}

fn alloc_node(seg: &Segment, role: i64) -> Result<usize> {
    let offset = fixed::alloc(seg, &seg.header().ttree_area)?;
    unsafe {
        atomic::store(seg.base(), offset + OFF_NEXT, 0);
        atomic::store(seg.base(), offset + OFF_ROLE, role);
    }
    wait_flag(seg, offset).store(1, Ordering::SeqCst);
    Ok(offset)
}

fn free_node(seg: &Segment, node: usize) {
    fixed::free(seg, &seg.header().ttree_area, node);
}

fn enqueue(seg: &Segment, lock: &LockHeader, node: usize) -> usize {
    loop {
        let prev = lock.word0.load(Ordering::SeqCst);
        if lock
            .word0
            .compare_exchange(prev, node as i64, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return prev as usize;
        }
    }
}

fn block_until_released(seg: &Segment, node: usize, deadline: Option<Instant>) -> Result<()> {
    loop {
        let flag = wait_flag(seg, node);
        if flag.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        match deadline {
            None => crate::lock::futex::wait(flag, 1),
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    unsafe { atomic::store(seg.base(), node + OFF_ROLE, ROLE_ABANDONED) };
                    return Err(DbError::new(
                        Status::LockTimeout,
                        Some("task-fair queued lock wait exceeded its timeout"),
                    ));
                }
                crate::lock::futex::wait_timeout(flag, 1, remaining);
            }
        }
    }
}

fn acquire(seg: &Segment, lock: &LockHeader, role: i64, deadline: Option<Instant>) -> Result<Ticket> {
    let node = alloc_node(seg, role)?;
    let prev = enqueue(seg, lock, node);
    if prev == 0 {
        return Ok(Ticket(node));
    }
    unsafe { atomic::store(seg.base(), prev + OFF_NEXT, node as i64) };
    if role == ROLE_READER {
        let prev_role = unsafe { atomic::load(seg.base(), prev + OFF_ROLE) };
        let prev_waiting = wait_flag(seg, prev).load(Ordering::SeqCst) != 0;
        if prev_role == ROLE_READER && !prev_waiting {
            return Ok(Ticket(node));
        }
    }
    block_until_released(seg, node, deadline)?;
    Ok(Ticket(node))
}

pub fn start_read(seg: &Segment, lock: &LockHeader) -> Result<Ticket> {
    acquire(seg, lock, ROLE_READER, None)
}

pub fn start_write(seg: &Segment, lock: &LockHeader) -> Result<Ticket> {
    acquire(seg, lock, ROLE_WRITER, None)
}

pub fn start_write_timeout(seg: &Segment, lock: &LockHeader, timeout: Duration) -> Result<Ticket> {
    acquire(seg, lock, ROLE_WRITER, Some(Instant::now() + timeout))
}

pub fn start_read_timeout(seg: &Segment, lock: &LockHeader, timeout: Duration) -> Result<Ticket> {
    acquire(seg, lock, ROLE_READER, Some(Instant::now() + timeout))
}

/// Releases `ticket`, waking the next eligible waiter(s): a writer wakes
/// exactly one successor; a reader wakes its successor and, while that
/// successor is itself a reader, cascades the wake down the run of
/// contiguous waiting readers behind it. Abandoned (timed-out) nodes are
/// skipped and freed as the release walk passes over them.
pub fn release(seg: &Segment, lock: &LockHeader, ticket: Ticket) {
    let node = ticket.0;
    let role = unsafe { atomic::load(seg.base(), node + OFF_ROLE) };
    loop {
        let next = unsafe { atomic::load(seg.base(), node + OFF_NEXT) };
        if next == 0 {
            if lock
                .word0
                .compare_exchange(node as i64, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                free_node(seg, node);
                return;
            }
            // a successor is linking concurrently; its `next` store has
            // not landed yet even though the tail already points past us.
            continue;
        }
        wake_run(seg, lock, next as usize, role);
        free_node(seg, node);
        return;
    }
}

/// Walks forward from `next`, freeing any abandoned (timed-out) nodes it
/// passes over. If the abandoned run reaches the tail with no live
/// successor, retires the queue by CASing `lock.word0` back to empty so a
/// freed node's offset never lingers as a stale tail.
fn wake_run(seg: &Segment, lock: &LockHeader, mut next: usize, releasing_role: i64) {
    loop {
        let next_role = unsafe { atomic::load(seg.base(), next + OFF_ROLE) };
        if next_role == ROLE_ABANDONED {
            let mut after = unsafe { atomic::load(seg.base(), next + OFF_NEXT) };
            if after == 0 {
                if lock
                    .word0
                    .compare_exchange(next as i64, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    free_node(seg, next);
                    return;
                }
                loop {
                    after = unsafe { atomic::load(seg.base(), next + OFF_NEXT) };
                    if after != 0 {
                        break;
                    }
                }
            }
            free_node(seg, next);
            next = after as usize;
            continue;
        }
        clear_and_wake(seg, next);
        if releasing_role != ROLE_READER || next_role != ROLE_READER {
            return;
        }
        let after = unsafe { atomic::load(seg.base(), next + OFF_NEXT) };
        if after == 0 {
            return;
        }
        next = after as usize;
    }
}

fn clear_and_wake(seg: &Segment, node: usize) {
    let flag = wait_flag(seg, node);
    flag.store(0, Ordering::SeqCst);
    crate::lock::futex::wake(flag, 1);
}

#[cfg(test)]
mod test_tfq {
    use super::*;
    use crate::mem::segment::Segment;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc;
    use std::thread;

    fn fresh() -> Segment {
        Segment::attach_local(256 * 1024).unwrap()
    }

    #[test]
    fn test_uncontended_write_is_immediate() {
        let seg = fresh();
        let lock = &seg.header().locks;
        let t = start_write(&seg, lock).unwrap();
        release(&seg, lock, t);
        assert_eq!(lock.word0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_n_threads_k_increments_is_exact() {
        let seg = Arc::new(fresh());
        let counter_offset = seg.size() - 8;
        let n = 6;
        let k = 150;
        let mut handles = vec![];
        for _ in 0..n {
            let seg = Arc::clone(&seg);
            handles.push(thread::spawn(move || {
                for _ in 0..k {
                    let lock = &seg.header().locks;
                    let t = start_write(&seg, lock).unwrap();
                    unsafe {
                        let v = atomic::load(seg.base(), counter_offset);
                        atomic::store(seg.base(), counter_offset, v + 1);
                    }
                    release(&seg, lock, t);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let total = unsafe { atomic::load(seg.base(), counter_offset) };
        assert_eq!(total, (n * k) as i64);
    }

    #[test]
    fn test_reader_behind_reader_does_not_block() {
        let seg = Arc::new(fresh());
        let w = start_write(&seg, &seg.header().locks).unwrap();
        // two readers enqueue behind the active writer
        let done = Arc::new(AtomicUsize::new(0));
        let (seg1, d1) = (Arc::clone(&seg), Arc::clone(&done));
        let h1 = thread::spawn(move || {
            let t = start_read(&seg1, &seg1.header().locks).unwrap();
            d1.fetch_add(1, StdOrdering::SeqCst);
            release(&seg1, &seg1.header().locks, t);
        });
        thread::sleep(Duration::from_millis(20));
        let (seg2, d2) = (Arc::clone(&seg), Arc::clone(&done));
        let h2 = thread::spawn(move || {
            let t = start_read(&seg2, &seg2.header().locks).unwrap();
            d2.fetch_add(1, StdOrdering::SeqCst);
            release(&seg2, &seg2.header().locks, t);
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(done.load(StdOrdering::SeqCst), 0, "both readers still wait on the writer");
        release(&seg, &seg.header().locks, w);
        h1.join().unwrap();
        h2.join().unwrap();
        assert_eq!(done.load(StdOrdering::SeqCst), 2);
    }

    #[test]
    fn test_timeout_abandons_without_deadlocking_the_queue() {
        let seg = fresh();
        let lock = &seg.header().locks;
        let w = start_write(&seg, lock).unwrap();
        let err = start_write_timeout(&seg, lock, Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.status(), Status::LockTimeout);
        release(&seg, lock, w);
        // the queue must still be usable after an abandoned node is
        // skipped over by the releasing writer.
        let t2 = start_write(&seg, lock).unwrap();
        release(&seg, lock, t2);
    }
}
