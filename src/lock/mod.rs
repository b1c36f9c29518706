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

//! The database-wide reader/writer lock (§4.H). One protocol is selected
//! when a segment is created and baked into its feature bitmask and
//! `lock_protocol` field; every process attaching to that segment must
//! agree, which `segment::validate_existing` already enforces by
//! rejecting a feature mismatch. `start_read`/`start_write` and their
//! `end_*` counterparts are the only entry points the rest of the core
//! (§4.G record ops, §4.I journal, §4.J dump) ever calls; which protocol
//! actually runs is an implementation detail of this module alone.

pub mod futex;
pub mod rp;
pub mod tfq;
pub mod wp;

use std::time::Duration;

use crate::error::Result;
use crate::mem::segment::Segment;

/// Selects which of the three RW-lock protocols a segment uses. Stored in
/// the segment header as a `u32` (`SegmentHeader::lock_protocol`).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u32)]
pub enum Protocol {
    /// Reader-preference spinlock: simplest, fair to readers.
    Rp = 0,
    /// Writer-preference spinlock: avoids write starvation under read load.
    Wp = 1,
    /// Task-fair queued lock: FIFO fairness, blocks on a futex instead of
    /// spinning.
    Tfq = 2,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Rp
    }
}

impl Protocol {
    pub fn from_u32(v: u32) -> Option<Protocol> {
        match v {
            0 => Some(Protocol::Rp),
            1 => Some(Protocol::Wp),
            2 => Some(Protocol::Tfq),
            _ => None,
        }
    }
}

/// A held lock's release token. RP and WP need none; TFQ must hand its
/// queue-node ticket back to `end_read`/`end_write`.
#[derive(Debug, Clone, Copy)]
pub enum Held {
    Spin,
    Queued(tfq::Ticket),
}

fn protocol_of(seg: &Segment) -> Protocol {
    let raw = seg
        .header()
        .lock_protocol
        .load(std::sync::atomic::Ordering::SeqCst);
    Protocol::from_u32(raw).unwrap_or_default()
}

pub fn start_read(seg: &Segment) -> Result<Held> {
    let protocol = protocol_of(seg);
    debug!("lock: start_read via {:?}", protocol);
    match protocol {
        Protocol::Rp => rp::start_read(&seg.header().locks).map(|_| Held::Spin),
        Protocol::Wp => wp::start_read(&seg.header().locks).map(|_| Held::Spin),
        Protocol::Tfq => tfq::start_read(seg, &seg.header().locks).map(Held::Queued),
    }
}

pub fn end_read(seg: &Segment, held: Held) {
    match (protocol_of(seg), held) {
        (Protocol::Rp, Held::Spin) => rp::end_read(&seg.header().locks),
        (Protocol::Wp, Held::Spin) => wp::end_read(&seg.header().locks),
        (Protocol::Tfq, Held::Queued(t)) => tfq::release(seg, &seg.header().locks, t),
        _ => unreachable!("a segment's lock protocol never changes after attach"),
    }
}

pub fn start_write(seg: &Segment) -> Result<Held> {
    let protocol = protocol_of(seg);
    debug!("lock: start_write via {:?}", protocol);
    match protocol {
        Protocol::Rp => rp::start_write(&seg.header().locks).map(|_| Held::Spin),
        Protocol::Wp => wp::start_write(&seg.header().locks).map(|_| Held::Spin),
        Protocol::Tfq => tfq::start_write(seg, &seg.header().locks).map(Held::Queued),
    }
}

pub fn end_write(seg: &Segment, held: Held) {
    match (protocol_of(seg), held) {
        (Protocol::Rp, Held::Spin) => rp::end_write(&seg.header().locks),
        (Protocol::Wp, Held::Spin) => wp::end_write(&seg.header().locks),
        (Protocol::Tfq, Held::Queued(t)) => tfq::release(seg, &seg.header().locks, t),
        _ => unreachable!("a segment's lock protocol never changes after attach"),
    }
}

/// Time-bounded write acquisition; only meaningful for TFQ (§4.H
/// "Cancellation"). RP/WP ignore `timeout` and fall back to their
/// compile-time spin bound.
pub fn start_write_timeout(seg: &Segment, timeout: Duration) -> Result<Held> {
    match protocol_of(seg) {
        Protocol::Tfq => tfq::start_write_timeout(seg, &seg.header().locks, timeout).map(Held::Queued),
        _ => start_write(seg),
    }
}

pub fn start_read_timeout(seg: &Segment, timeout: Duration) -> Result<Held> {
    match protocol_of(seg) {
        Protocol::Tfq => tfq::start_read_timeout(seg, &seg.header().locks, timeout).map(Held::Queued),
        _ => start_read(seg),
    }
}

/// Re-initializes the lock words to their unheld state. Called by
/// segment init and by dump `import` (§4.J: "lock ownership does not
/// survive a dump").
pub fn reset(seg: &Segment) {
    use std::sync::atomic::Ordering;
    let locks = &seg.header().locks;
    locks.word0.store(0, Ordering::SeqCst);
    locks.word1.store(0, Ordering::SeqCst);
    locks.word2.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod test_lock {
    use super::*;
    use crate::mem::segment::Segment;

    #[test]
    fn test_default_protocol_is_rp() {
        let seg = Segment::attach_local(128 * 1024).unwrap();
        assert_eq!(protocol_of(&seg), Protocol::Rp);
    }

    #[test]
    fn test_write_then_read_via_dispatch() {
        let seg = Segment::attach_local(128 * 1024).unwrap();
        let h = start_write(&seg).unwrap();
        end_write(&seg, h);
        let h = start_read(&seg).unwrap();
        end_read(&seg, h);
    }

    #[test]
    fn test_reset_clears_lock_words() {
        let seg = Segment::attach_local(128 * 1024).unwrap();
        let h = start_write(&seg).unwrap();
        end_write(&seg, h);
        reset(&seg);
        assert_eq!(seg.header().locks.word0.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
