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

//! Linux futex wrapper used by the task-fair queued lock (§4.H TFQ) to
//! block a waiter on its own queue node instead of spinning.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Blocks the calling thread while `*word == expected`, with no timeout.
/// Spurious wakeups are possible; callers loop on the flag themselves.
pub fn wait(word: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
        );
    }
}

/// Same as [`wait`], but gives up after `timeout` and returns `false` if
/// the wait did not return because the word changed (i.e. it is unknown
/// whether a wake happened; the caller must re-check the flag either
/// way, same as a plain futex wait).
pub fn wait_timeout(word: &AtomicU32, expected: u32, timeout: Duration) -> bool {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as i64,
    };
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
        )
    };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        return err.raw_os_error() != Some(libc::ETIMEDOUT);
    }
    true
}

/// Wakes up to `count` threads blocked in [`wait`]/[`wait_timeout`] on
/// `word`.
pub fn wake(word: &AtomicU32, count: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            count,
        );
    }
}

#[cfg(test)]
mod test_futex {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wake_unblocks_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let w = Arc::clone(&word);
        let handle = thread::spawn(move || {
            wait(&w, 0);
        });
        thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::SeqCst);
        wake(&word, 1);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_returns_immediately_if_value_already_changed() {
        let word = AtomicU32::new(5);
        // expected no longer matches, so the kernel returns EAGAIN at once.
        wait(&word, 0);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let word = AtomicU32::new(0);
        let woke_naturally = wait_timeout(&word, 0, Duration::from_millis(10));
        assert!(!woke_naturally);
    }
}
